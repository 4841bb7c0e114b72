//! Per-item enrichment pipeline.
//!
//! Stages run strictly in order: fetch, extract, embed, analyze, persist,
//! notify. Only fetch can abort an item. Extraction and embedding failures
//! leave their field empty, and analysis failures turn into placeholder or
//! failed enrichment. The item reaches the record store in one write at the
//! persist stage, so an abandoned run never leaves a partial record behind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use papertrail_core::{
    defaults, AnalysisError, AnalysisRequest, CatalogItem, CatalogRepository, ContentSource,
    Enrichment, EnrichmentStatus, Error, ItemEmbedding, ProgressBroadcaster, ProgressEvent,
    ProgressStage, PutOutcome, Result, SourceItemRef,
};
use papertrail_inference::{AnalysisGateway, EmbeddingGateway};

use crate::graph::GraphUpdater;
use crate::{env_u64, store_call};

/// Timeouts and input sizes for the pipeline stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_timeout: Duration,
    pub extract_timeout: Duration,
    pub store_timeout: Duration,
    /// Characters of full text appended to the embedding input.
    pub embed_text_chars: usize,
    /// Characters of full text sent for analysis.
    pub analysis_text_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
            extract_timeout: Duration::from_secs(defaults::EXTRACT_TIMEOUT_SECS),
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
            embed_text_chars: defaults::EMBED_TEXT_CHARS,
            analysis_text_chars: defaults::ANALYSIS_TEXT_CHARS,
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PAPERTRAIL_FETCH_TIMEOUT_SECS` | `30` | Metadata fetch deadline |
    /// | `PAPERTRAIL_EXTRACT_TIMEOUT_SECS` | `60` | Full-text fetch deadline |
    /// | `PAPERTRAIL_STORE_TIMEOUT_SECS` | `10` | Record store call deadline |
    /// | `PAPERTRAIL_EMBED_TEXT_CHARS` | `4000` | Full-text prefix embedded |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fetch_timeout: env_u64("PAPERTRAIL_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.fetch_timeout),
            extract_timeout: env_u64("PAPERTRAIL_EXTRACT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.extract_timeout),
            store_timeout: env_u64("PAPERTRAIL_STORE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.store_timeout),
            embed_text_chars: env_u64("PAPERTRAIL_EMBED_TEXT_CHARS")
                .map(|v| v as usize)
                .unwrap_or(d.embed_text_chars),
            analysis_text_chars: d.analysis_text_chars,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

/// Result of ingesting one discovered reference.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Persisted with a terminal status (complete, placeholder or failed).
    Stored(CatalogItem),
    /// The id already exists in the store; nothing was written.
    Duplicate(EnrichmentStatus),
    /// Metadata could not be fetched; nothing was written.
    FetchFailed(String),
}

impl IngestOutcome {
    /// Whether a new record was written.
    pub fn is_imported(&self) -> bool {
        matches!(self, IngestOutcome::Stored(_))
    }
}

/// Result of re-running analysis on a placeholder item.
#[derive(Debug, Clone, PartialEq)]
pub enum ReanalyzeOutcome {
    Completed,
    /// Provider still down; item unchanged.
    StillUnavailable(String),
    /// Provider rejected the input; item unchanged.
    Rejected(String),
    /// Another writer changed the item first.
    Superseded(EnrichmentStatus),
}

pub struct EnrichmentPipeline {
    source: Arc<dyn ContentSource>,
    catalog: Arc<dyn CatalogRepository>,
    embeddings: Arc<EmbeddingGateway>,
    analysis: Arc<AnalysisGateway>,
    graph: Arc<GraphUpdater>,
    progress: ProgressBroadcaster,
    config: PipelineConfig,
}

impl EnrichmentPipeline {
    pub fn new(
        source: Arc<dyn ContentSource>,
        catalog: Arc<dyn CatalogRepository>,
        embeddings: Arc<EmbeddingGateway>,
        analysis: Arc<AnalysisGateway>,
        graph: Arc<GraphUpdater>,
        progress: ProgressBroadcaster,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            catalog,
            embeddings,
            analysis,
            graph,
            progress,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Ingest a newly discovered reference.
    ///
    /// An id that already exists is never reprocessed here: complete items
    /// are done, placeholder items belong to the backfill worker and failed
    /// items wait for a manual trigger.
    #[instrument(skip(self, item_ref), fields(subsystem = "pipeline", op = "ingest", item_id = %item_ref.id))]
    pub async fn ingest(&self, item_ref: &SourceItemRef) -> Result<IngestOutcome> {
        if let Some(existing) = self.get(&item_ref.id).await? {
            let status = existing.status();
            debug!(status = %status, "Item already catalogued");
            self.emit(
                ProgressEvent::item(&item_ref.id, ProgressStage::Duplicate)
                    .with_message(format!("already {}", status)),
            );
            return Ok(IngestOutcome::Duplicate(status));
        }
        self.process(item_ref, None).await
    }

    /// Synchronous single-item ingestion for "add this item now" requests.
    ///
    /// - unknown id: full pipeline
    /// - complete or placeholder: returned as is; placeholders are upgraded
    ///   only by the backfill worker
    /// - pending: full pipeline, replacing the stored record
    /// - failed: full pipeline once; later calls are rejected
    #[instrument(skip(self, item_ref), fields(subsystem = "pipeline", op = "trigger_manual", item_id = %item_ref.id))]
    pub async fn trigger_manual(&self, item_ref: &SourceItemRef) -> Result<CatalogItem> {
        let existing = self.get(&item_ref.id).await?;

        if let Some(item) = &existing {
            match item.status() {
                EnrichmentStatus::Complete | EnrichmentStatus::Placeholder => {
                    return Ok(item.clone())
                }
                EnrichmentStatus::Failed if item.manual_retry_used => {
                    return Err(Error::InvalidInput(format!(
                        "manual retry already used for {}",
                        item.id
                    )));
                }
                _ => {}
            }
        }

        match self.process(item_ref, existing.as_ref()).await? {
            IngestOutcome::Stored(item) => Ok(item),
            IngestOutcome::FetchFailed(msg) => Err(Error::Source(msg)),
            IngestOutcome::Duplicate(_) => self
                .get(&item_ref.id)
                .await?
                .ok_or_else(|| Error::ItemNotFound(item_ref.id.clone())),
        }
    }

    /// Re-run only the analyze stage for a placeholder item, then persist
    /// and notify. Metadata, content and embedding are reused.
    #[instrument(skip(self, item), fields(subsystem = "pipeline", op = "reanalyze", item_id = %item.id))]
    pub async fn reanalyze(&self, item: &CatalogItem) -> Result<ReanalyzeOutcome> {
        let expected = item.status();
        if expected != EnrichmentStatus::Placeholder {
            return Ok(ReanalyzeOutcome::Superseded(expected));
        }

        self.emit(ProgressEvent::item(&item.id, ProgressStage::Analyze));
        let request = AnalysisRequest::for_item(item, self.config.analysis_text_chars);
        let fields = match self.analysis.analyze(&request).await {
            Ok(fields) => fields,
            Err(AnalysisError::Unavailable(msg)) => {
                debug!(error = %msg, "Analysis still unavailable");
                return Ok(ReanalyzeOutcome::StillUnavailable(msg));
            }
            Err(AnalysisError::InvalidInput(msg)) => {
                warn!(error = %msg, "Analysis rejected placeholder item");
                return Ok(ReanalyzeOutcome::Rejected(msg));
            }
        };

        let mut updated = item.clone();
        updated.enrichment = Enrichment::from_fields(fields);

        self.emit(ProgressEvent::item(&item.id, ProgressStage::Persist));
        match self.compare_and_put(&updated, expected).await? {
            PutOutcome::Written => {}
            PutOutcome::StatusChanged(now) => return Ok(ReanalyzeOutcome::Superseded(now)),
            PutOutcome::NotFound => return Err(Error::ItemNotFound(item.id.clone())),
        }

        self.notify(&updated).await?;
        self.emit(ProgressEvent::item(&item.id, ProgressStage::Backfilled));
        info!("Placeholder item backfilled");
        Ok(ReanalyzeOutcome::Completed)
    }

    /// Run every stage. `prior` is the stored record being replaced, if any.
    async fn process(
        &self,
        item_ref: &SourceItemRef,
        prior: Option<&CatalogItem>,
    ) -> Result<IngestOutcome> {
        let start = Instant::now();
        let id = item_ref.id.as_str();

        // Fetch
        self.emit(ProgressEvent::item(id, ProgressStage::Fetch));
        let metadata = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.source.fetch_metadata(item_ref),
        )
        .await
        {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(e)) => return Ok(self.fetch_failed(id, e.to_string())),
            Err(_) => {
                return Ok(self.fetch_failed(
                    id,
                    format!(
                        "metadata fetch timed out after {}s",
                        self.config.fetch_timeout.as_secs()
                    ),
                ))
            }
        };

        let mut item = CatalogItem::new(id, metadata);
        if let Some(prior) = prior {
            item.created_at = prior.created_at;
            item.manual_retry_used =
                prior.manual_retry_used || prior.status() == EnrichmentStatus::Failed;
        }

        // Extract
        self.emit(ProgressEvent::item(id, ProgressStage::Extract));
        item.raw_content = match tokio::time::timeout(
            self.config.extract_timeout,
            self.source.fetch_content(item_ref),
        )
        .await
        {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!(error = %e, "Content extraction failed, continuing without full text");
                None
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.extract_timeout.as_secs(),
                    "Content extraction timed out, continuing without full text"
                );
                None
            }
        };

        // Embed
        self.emit(ProgressEvent::item(id, ProgressStage::Embed));
        item.embedding = self.embed(&item).await;

        // Analyze
        self.emit(ProgressEvent::item(id, ProgressStage::Analyze));
        item.enrichment = self.analyze(&item).await;

        // Persist
        self.emit(ProgressEvent::item(id, ProgressStage::Persist));
        let written = match prior {
            None => {
                if !self.insert(&item).await? {
                    let status = self
                        .get(id)
                        .await?
                        .map(|i| i.status())
                        .unwrap_or(EnrichmentStatus::Pending);
                    debug!(status = %status, "Lost insert race");
                    return Ok(IngestOutcome::Duplicate(status));
                }
                item
            }
            Some(prior) => match self.compare_and_put(&item, prior.status()).await? {
                PutOutcome::Written => item,
                PutOutcome::StatusChanged(status) => return Ok(IngestOutcome::Duplicate(status)),
                PutOutcome::NotFound => return Err(Error::ItemNotFound(id.to_string())),
            },
        };

        // Notify
        self.notify(&written).await?;
        info!(
            status = %written.status(),
            has_content = written.raw_content.is_some(),
            has_embedding = written.embedding.is_some(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Item ingested"
        );
        Ok(IngestOutcome::Stored(written))
    }

    async fn embed(&self, item: &CatalogItem) -> Option<ItemEmbedding> {
        let text = item.embedding_text(self.config.embed_text_chars);
        if text.is_empty() {
            debug!("Nothing to embed");
            return None;
        }
        match self.embeddings.embed(&text).await {
            Ok(out) => {
                debug!(provider = %out.provider, dim = out.vector.len(), "Embedding computed");
                Some(out.into())
            }
            Err(e) => {
                warn!(error = %e, "Embedding failed on every provider, storing without vector");
                None
            }
        }
    }

    async fn analyze(&self, item: &CatalogItem) -> Enrichment {
        let request = AnalysisRequest::for_item(item, self.config.analysis_text_chars);
        match self.analysis.analyze(&request).await {
            Ok(fields) => Enrichment::from_fields(fields),
            Err(AnalysisError::Unavailable(msg)) => {
                warn!(error = %msg, "Analysis unavailable, storing placeholders");
                Enrichment::all_placeholder()
            }
            Err(AnalysisError::InvalidInput(msg)) => {
                warn!(error = %msg, "Analysis rejected input, marking failed");
                Enrichment::failed(msg)
            }
        }
    }

    /// Publish the terminal status and, for complete items, update the graph
    /// before returning.
    async fn notify(&self, item: &CatalogItem) -> Result<()> {
        let status = item.status();
        match status {
            EnrichmentStatus::Complete => {
                self.graph.on_item_complete(item).await?;
                self.emit(ProgressEvent::item(&item.id, ProgressStage::Complete));
            }
            EnrichmentStatus::Placeholder => {
                self.emit(
                    ProgressEvent::item(&item.id, ProgressStage::Placeholder)
                        .with_message("analysis deferred until the provider recovers"),
                );
            }
            EnrichmentStatus::Failed => {
                let reason = item.enrichment.failure.clone().unwrap_or_default();
                self.emit(ProgressEvent::item(&item.id, ProgressStage::Failed).with_message(reason));
            }
            EnrichmentStatus::Pending => {
                warn!(item_id = %item.id, "Persisted item without terminal status");
            }
        }
        Ok(())
    }

    fn fetch_failed(&self, id: &str, msg: String) -> IngestOutcome {
        warn!(item_id = %id, error = %msg, "Metadata fetch failed, item skipped");
        self.emit(ProgressEvent::item(id, ProgressStage::Failed).with_message(msg.clone()));
        IngestOutcome::FetchFailed(msg)
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.publish(event);
    }

    async fn get(&self, id: &str) -> Result<Option<CatalogItem>> {
        store_call("catalog get", self.config.store_timeout, self.catalog.get(id)).await
    }

    async fn insert(&self, item: &CatalogItem) -> Result<bool> {
        store_call(
            "catalog insert",
            self.config.store_timeout,
            self.catalog.insert(item),
        )
        .await
    }

    async fn compare_and_put(
        &self,
        item: &CatalogItem,
        expected: EnrichmentStatus,
    ) -> Result<PutOutcome> {
        store_call(
            "catalog compare_and_put",
            self.config.store_timeout,
            self.catalog.compare_and_put(item, expected),
        )
        .await
    }
}
