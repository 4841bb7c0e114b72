//! Catalog item repository.
//!
//! Metadata and enrichment are stored as JSONB. The derived enrichment status
//! lives in its own column so compare-and-put can guard on it and backfill
//! can scan by it. Annotation columns are only written by `set_annotations`.

use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, instrument};

use papertrail_core::{
    CatalogItem, CatalogRepository, EmbeddingProvider, Enrichment, EnrichmentStatus, Error,
    ItemEmbedding, ItemFilter, ManualAnnotations, PutOutcome, ReadStatus, Result, SourceMetadata,
};

const ITEM_COLUMNS: &str = "id, metadata, raw_content, embedding, embedding_provider, \
     embedding_model, enrichment, starred, read_status, user_notes, manual_retry_used, \
     created_at, updated_at";

pub struct PgCatalogRepository {
    pool: Pool<Postgres>,
}

impl PgCatalogRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn row_to_item(row: &PgRow) -> Result<CatalogItem> {
    let metadata: SourceMetadata = serde_json::from_value(row.try_get::<JsonValue, _>("metadata")?)?;
    let enrichment: Enrichment = serde_json::from_value(row.try_get::<JsonValue, _>("enrichment")?)?;

    let embedding = match row.try_get::<Option<Vector>, _>("embedding")? {
        Some(vector) => {
            let provider: String = row.try_get("embedding_provider")?;
            Some(ItemEmbedding {
                vector: vector.to_vec(),
                provider: provider.parse::<EmbeddingProvider>()?,
                model: row
                    .try_get::<Option<String>, _>("embedding_model")?
                    .unwrap_or_default(),
            })
        }
        None => None,
    };

    let read_status: String = row.try_get("read_status")?;
    Ok(CatalogItem {
        id: row.try_get("id")?,
        metadata,
        raw_content: row.try_get("raw_content")?,
        embedding,
        enrichment,
        annotations: ManualAnnotations {
            starred: row.try_get("starred")?,
            read_status: read_status.parse::<ReadStatus>()?,
            user_notes: row.try_get("user_notes")?,
        },
        manual_retry_used: row.try_get("manual_retry_used")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Columns written by the pipeline, in bind order after the key.
struct ItemBinds {
    metadata: JsonValue,
    embedding: Option<Vector>,
    provider: Option<&'static str>,
    model: Option<String>,
    enrichment: JsonValue,
    status: &'static str,
}

impl ItemBinds {
    fn from_item(item: &CatalogItem) -> Result<Self> {
        Ok(Self {
            metadata: serde_json::to_value(&item.metadata)?,
            embedding: item
                .embedding
                .as_ref()
                .map(|e| Vector::from(e.vector.clone())),
            provider: item.embedding.as_ref().map(|e| e.provider.as_str()),
            model: item.embedding.as_ref().map(|e| e.model.clone()),
            enrichment: serde_json::to_value(&item.enrichment)?,
            status: item.status().as_str(),
        })
    }
}

#[async_trait]
impl CatalogRepository for PgCatalogRepository {
    async fn get(&self, id: &str) -> Result<Option<CatalogItem>> {
        let row = sqlx::query(&format!("SELECT {} FROM catalog_item WHERE id = $1", ITEM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM catalog_item WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(exists)
    }

    #[instrument(skip(self, item), fields(subsystem = "database", component = "catalog", op = "insert", item_id = %item.id))]
    async fn insert(&self, item: &CatalogItem) -> Result<bool> {
        let binds = ItemBinds::from_item(item)?;
        let result = sqlx::query(
            "INSERT INTO catalog_item (
                 id, metadata, published_at, raw_content, embedding, embedding_provider,
                 embedding_model, enrichment, enrichment_status, starred, read_status,
                 user_notes, manual_retry_used, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&item.id)
        .bind(&binds.metadata)
        .bind(item.metadata.published_at)
        .bind(&item.raw_content)
        .bind(&binds.embedding)
        .bind(binds.provider)
        .bind(&binds.model)
        .bind(&binds.enrichment)
        .bind(binds.status)
        .bind(item.annotations.starred)
        .bind(item.annotations.read_status.as_str())
        .bind(&item.annotations.user_notes)
        .bind(item.manual_retry_used)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let inserted = result.rows_affected() == 1;
        debug!(inserted, status = binds.status, "Catalog insert");
        Ok(inserted)
    }

    #[instrument(skip(self, item), fields(subsystem = "database", component = "catalog", op = "compare_and_put", item_id = %item.id))]
    async fn compare_and_put(
        &self,
        item: &CatalogItem,
        expected: EnrichmentStatus,
    ) -> Result<PutOutcome> {
        let binds = ItemBinds::from_item(item)?;
        let result = sqlx::query(
            "UPDATE catalog_item SET
                 metadata = $3, published_at = $4, raw_content = $5, embedding = $6,
                 embedding_provider = $7, embedding_model = $8, enrichment = $9,
                 enrichment_status = $10, manual_retry_used = $11, updated_at = NOW()
             WHERE id = $1 AND enrichment_status = $2",
        )
        .bind(&item.id)
        .bind(expected.as_str())
        .bind(&binds.metadata)
        .bind(item.metadata.published_at)
        .bind(&item.raw_content)
        .bind(&binds.embedding)
        .bind(binds.provider)
        .bind(&binds.model)
        .bind(&binds.enrichment)
        .bind(binds.status)
        .bind(item.manual_retry_used)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 1 {
            return Ok(PutOutcome::Written);
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT enrichment_status FROM catalog_item WHERE id = $1")
                .bind(&item.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        match current {
            Some(status) => {
                let status = status.parse::<EnrichmentStatus>()?;
                debug!(expected = %expected, current = %status, "Compare-and-put lost");
                Ok(PutOutcome::StatusChanged(status))
            }
            None => Ok(PutOutcome::NotFound),
        }
    }

    async fn scan(&self, filter: ItemFilter) -> Result<Vec<CatalogItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM catalog_item
             WHERE ($1::text IS NULL OR enrichment_status = $1)
             ORDER BY id
             LIMIT $2",
            ITEM_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(row_to_item).collect()
    }

    async fn count_by_status(&self, status: EnrichmentStatus) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM catalog_item WHERE enrichment_status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count.max(0) as u64)
    }

    async fn set_annotations(&self, id: &str, annotations: &ManualAnnotations) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE catalog_item
             SET starred = $2, read_status = $3, user_notes = $4, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(annotations.starred)
        .bind(annotations.read_status.as_str())
        .bind(&annotations.user_notes)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }
}
