//! # papertrail-jobs
//!
//! Background ingestion for PaperTrail.
//!
//! This crate provides:
//! - [`EnrichmentPipeline`]: fetch, extract, embed, analyse and persist one item
//! - [`ImportScheduler`]: recurring, independently configured import tasks
//! - [`BackfillWorker`]: re-analysis of items parked behind placeholders
//! - [`GraphUpdater`]: shared-author and topic-similarity edges
//! - [`StatusReporter`]: dashboard health snapshot
//! - [`HttpSource`]: JSON item source over HTTP
//!
//! ## Example
//!
//! ```ignore
//! use papertrail_jobs::{ImportScheduler, SchedulerConfig};
//!
//! let scheduler = ImportScheduler::new(tasks, catalog, source, pipeline, progress,
//!     SchedulerConfig::from_env());
//! scheduler.resume_running().await?;
//!
//! let mut sub = progress.subscribe();
//! while let Some(event) = sub.recv().await {
//!     println!("{:?}", event);
//! }
//!
//! scheduler.shutdown().await;
//! ```

use std::future::Future;
use std::time::Duration;

pub mod backfill;
pub mod graph;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod status;

// Re-export core types
pub use papertrail_core::*;

pub use backfill::{BackfillConfig, BackfillHandle, BackfillReport, BackfillWorker};
pub use graph::{GraphConfig, GraphUpdater};
pub use pipeline::{EnrichmentPipeline, IngestOutcome, PipelineConfig, ReanalyzeOutcome};
pub use scheduler::{CycleReport, ImportScheduler, SchedulerConfig};
pub use source::HttpSource;
pub use status::StatusReporter;

/// Bound a record store call.
///
/// An elapsed deadline is reported as [`Error::Timeout`], which is transient:
/// the caller gives up on this cycle and tries again on the next one.
pub(crate) async fn store_call<T>(
    op: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "record store {} after {}s",
            op,
            timeout.as_secs()
        ))),
    }
}

/// Read a `u64` environment variable.
pub(crate) fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_store_deadline_is_transient() {
        let err = store_call("catalog exists", Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(11)).await;
            Ok(true)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Timed out: record store catalog exists after 10s");
    }

    #[tokio::test]
    async fn test_store_errors_pass_through() {
        let err = store_call::<()>("catalog insert", Duration::from_secs(10), async {
            Err(Error::Store("disk full".into()))
        })
        .await
        .unwrap_err();
        assert!(err.is_fatal());
    }
}
