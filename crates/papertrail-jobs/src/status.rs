//! Dashboard health snapshot.

use std::sync::Arc;
use std::time::Duration;

use papertrail_core::{defaults, CatalogRepository, EnrichmentStatus, Result, SystemStatus};
use papertrail_inference::{AnalysisGateway, EmbeddingGateway};

use crate::store_call;

/// Reads provider availability from the breakers and the backfill queue
/// size from the record store. Never calls a provider.
pub struct StatusReporter {
    embeddings: Arc<EmbeddingGateway>,
    analysis: Arc<AnalysisGateway>,
    catalog: Arc<dyn CatalogRepository>,
    store_timeout: Duration,
}

impl StatusReporter {
    pub fn new(
        embeddings: Arc<EmbeddingGateway>,
        analysis: Arc<AnalysisGateway>,
        catalog: Arc<dyn CatalogRepository>,
    ) -> Self {
        Self {
            embeddings,
            analysis,
            catalog,
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub async fn status(&self) -> Result<SystemStatus> {
        let backfill_queue_size = store_call(
            "count_by_status",
            self.store_timeout,
            self.catalog.count_by_status(EnrichmentStatus::Placeholder),
        )
        .await?;
        Ok(SystemStatus {
            embedding_primary_available: self.embeddings.is_primary_available(),
            llm_available: self.analysis.is_available(),
            backfill_queue_size,
        })
    }
}
