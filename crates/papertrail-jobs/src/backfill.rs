//! Background re-analysis of placeholder items.
//!
//! The worker wakes on a fixed interval, checks the analysis provider's
//! breaker and, only when it admits calls, re-runs analysis on a batch of
//! placeholder items. Each item is written back with a compare-and-put
//! against its placeholder status, so a concurrent manual trigger always
//! wins and annotations made in the meantime are never overwritten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use papertrail_core::{
    defaults, CatalogRepository, EnrichmentStatus, Error, ItemFilter, ProgressBroadcaster,
    ProgressEvent, ProgressStage, ProgressSubject, Result,
};
use papertrail_inference::AnalysisGateway;

use crate::pipeline::{EnrichmentPipeline, ReanalyzeOutcome};
use crate::{env_u64, store_call};

/// Configuration for the backfill worker.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Maximum placeholder items re-analysed per cycle.
    pub batch_size: usize,
    pub store_timeout: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(defaults::BACKFILL_INTERVAL_SECS),
            batch_size: defaults::BACKFILL_BATCH,
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
        }
    }
}

impl BackfillConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PAPERTRAIL_BACKFILL_ENABLED` | `true` | Run the worker at all |
    /// | `PAPERTRAIL_BACKFILL_INTERVAL_SECS` | `60` | Wake-up interval |
    /// | `PAPERTRAIL_BACKFILL_BATCH` | `50` | Items per cycle |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            enabled: std::env::var("PAPERTRAIL_BACKFILL_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(d.enabled),
            interval: env_u64("PAPERTRAIL_BACKFILL_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.interval),
            batch_size: env_u64("PAPERTRAIL_BACKFILL_BATCH")
                .filter(|b| *b > 0)
                .map(|b| b as usize)
                .unwrap_or(d.batch_size),
            store_timeout: env_u64("PAPERTRAIL_STORE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.store_timeout),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Outcome of one backfill cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// The breaker rejected calls, so no item was touched.
    pub skipped_unavailable: bool,
    pub scanned: usize,
    pub completed: usize,
    pub still_placeholder: usize,
    /// Items another writer changed first.
    pub superseded: usize,
    /// Shutdown arrived mid-batch; the remaining items were left alone.
    pub interrupted: bool,
}

/// Handle to a running backfill worker.
pub struct BackfillHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackfillHandle {
    /// Signal the worker to stop. A batch in progress ends after the item
    /// being analysed.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send backfill shutdown signal".into()))
    }

    /// Wait for the worker loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(error = ?e, "Backfill worker panicked");
        }
    }
}

pub struct BackfillWorker {
    catalog: Arc<dyn CatalogRepository>,
    analysis: Arc<AnalysisGateway>,
    pipeline: Arc<EnrichmentPipeline>,
    progress: ProgressBroadcaster,
    config: BackfillConfig,
}

impl BackfillWorker {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        analysis: Arc<AnalysisGateway>,
        pipeline: Arc<EnrichmentPipeline>,
        progress: ProgressBroadcaster,
        config: BackfillConfig,
    ) -> Self {
        Self {
            catalog,
            analysis,
            pipeline,
            progress,
            config,
        }
    }

    /// Start the worker loop and return a handle for control.
    pub fn start(self) -> BackfillHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        BackfillHandle {
            shutdown_tx,
            handle,
        }
    }

    #[instrument(skip(self, shutdown_rx), fields(subsystem = "backfill"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Backfill worker is disabled, not starting");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Backfill worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Backfill worker received shutdown signal");
                    break;
                }
                _ = sleep(self.config.interval) => {}
            }

            match self.cycle(Some(&mut *shutdown_rx)).await {
                Ok(report) if report.interrupted => {
                    info!("Backfill worker received shutdown signal mid-batch");
                    break;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Backfill cycle failed"),
            }
        }
        info!("Backfill worker stopped");
    }

    /// One wake-up: scan placeholders and re-analyse them while the
    /// provider stays available.
    pub async fn run_cycle(&self) -> Result<BackfillReport> {
        self.cycle(None).await
    }

    /// `stop` is polled between items.
    #[instrument(skip(self, stop), fields(subsystem = "backfill", op = "run_cycle"))]
    async fn cycle(&self, mut stop: Option<&mut mpsc::Receiver<()>>) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();

        if !self.analysis.is_available() {
            debug!("Analysis provider unavailable, skipping backfill");
            report.skipped_unavailable = true;
            self.progress.publish(
                ProgressEvent::new(ProgressSubject::System, ProgressStage::CycleSkipped)
                    .with_message("analysis provider unavailable"),
            );
            return Ok(report);
        }

        let start = Instant::now();
        let items = store_call(
            "catalog scan",
            self.config.store_timeout,
            self.catalog.scan(
                ItemFilter::with_status(EnrichmentStatus::Placeholder)
                    .limit(self.config.batch_size),
            ),
        )
        .await?;
        report.scanned = items.len();
        if items.is_empty() {
            debug!("No placeholder items");
            return Ok(report);
        }

        for item in &items {
            if let Some(rx) = stop.as_deref_mut() {
                if matches!(rx.try_recv(), Ok(()) | Err(TryRecvError::Disconnected)) {
                    report.interrupted = true;
                    break;
                }
            }
            match self.pipeline.reanalyze(item).await? {
                ReanalyzeOutcome::Completed => report.completed += 1,
                ReanalyzeOutcome::Superseded(status) => {
                    debug!(item_id = %item.id, status = %status, "Placeholder superseded");
                    report.superseded += 1;
                }
                ReanalyzeOutcome::Rejected(msg) => {
                    warn!(item_id = %item.id, error = %msg, "Placeholder rejected by provider");
                    report.still_placeholder += 1;
                }
                ReanalyzeOutcome::StillUnavailable(_) => {
                    report.still_placeholder += 1;
                    if !self.analysis.is_available() {
                        info!("Analysis provider went down mid-cycle, stopping backfill");
                        break;
                    }
                }
            }
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            remaining = report.still_placeholder,
            duration_ms = start.elapsed().as_millis() as u64,
            "Backfill cycle finished"
        );
        Ok(report)
    }
}
