//! Core traits for PaperTrail abstractions.
//!
//! These traits define the interfaces that sources, record stores and AI
//! providers must satisfy, so the workers can run against PostgreSQL and
//! Ollama in production and against in-memory doubles in tests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// SOURCE TRAITS
// =============================================================================

/// Discovery side of an item source.
#[async_trait]
pub trait SourceQuery: Send + Sync {
    /// Return references matching `filter` in the requested order.
    async fn query(&self, filter: &ImportFilter, order: SortOrder) -> Result<Vec<SourceItemRef>>;
}

/// Retrieval side of an item source.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch bibliographic metadata for one item.
    async fn fetch_metadata(&self, item: &SourceItemRef) -> Result<SourceMetadata>;

    /// Fetch the extracted full text for one item.
    async fn fetch_content(&self, item: &SourceItemRef) -> Result<String>;
}

// =============================================================================
// RECORD STORE TRAITS
// =============================================================================

/// Durable storage for catalog items.
///
/// Every write is atomic per record. Writes made by the ingestion core never
/// touch [`ManualAnnotations`]; only [`CatalogRepository::set_annotations`]
/// does.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Fetch an item by id.
    async fn get(&self, id: &str) -> Result<Option<CatalogItem>>;

    /// Check whether an item with this id exists.
    async fn exists(&self, id: &str) -> Result<bool>;

    /// Insert a new item. Returns `false` without writing if the id exists.
    async fn insert(&self, item: &CatalogItem) -> Result<bool>;

    /// Replace the non-annotation fields of an item, but only if its stored
    /// status still equals `expected`.
    async fn compare_and_put(
        &self,
        item: &CatalogItem,
        expected: EnrichmentStatus,
    ) -> Result<PutOutcome>;

    /// Scan items matching the filter.
    async fn scan(&self, filter: ItemFilter) -> Result<Vec<CatalogItem>>;

    /// Count items with the given status.
    async fn count_by_status(&self, status: EnrichmentStatus) -> Result<u64>;

    /// Overwrite the user-owned annotations. Returns `false` if the item is missing.
    async fn set_annotations(&self, id: &str, annotations: &ManualAnnotations) -> Result<bool>;
}

/// Storage for relationship graph edges.
#[async_trait]
pub trait EdgeRepository: Send + Sync {
    /// Insert an edge or overwrite the weight of the existing one for the
    /// same pair and kind.
    async fn upsert(&self, edge: &RelationshipEdge) -> Result<()>;

    /// All edges touching an item.
    async fn edges_for(&self, item_id: &str) -> Result<Vec<RelationshipEdge>>;

    /// All edges.
    async fn list(&self) -> Result<Vec<RelationshipEdge>>;
}

/// Storage for import task configuration and counters.
#[async_trait]
pub trait ImportTaskRepository: Send + Sync {
    async fn create(&self, task: &ImportTask) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<ImportTask>>;

    /// List tasks, optionally restricted to one status.
    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<ImportTask>>;

    /// Durably record a status change. Fails with `TaskNotFound` if missing.
    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()>;

    /// Count one attempted item, and one imported item if `imported`.
    async fn record_item(&self, id: Uuid, imported: bool) -> Result<()>;

    /// Stamp the end of a poll cycle.
    async fn finish_cycle(&self, id: Uuid, at: chrono::DateTime<chrono::Utc>) -> Result<()>;

    /// Append to the bounded log tail.
    async fn append_log(&self, id: Uuid, entry: TaskLogEntry) -> Result<()>;
}

// =============================================================================
// INFERENCE TRAITS
// =============================================================================

/// Backend for generating embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts.
    ///
    /// Returns a vector of embedding vectors, one per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}

/// Backend for text generation (LLM).
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate text with system context.
    async fn generate_with_system(&self, system: &str, prompt: &str) -> Result<String>;

    /// Generate with the output constrained to a JSON document, where the
    /// backend supports it.
    async fn generate_json_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        self.generate_with_system(system, prompt).await
    }

    /// Get the model name being used.
    fn model_name(&self) -> &str;

    /// Check if the backend is available and responding.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
