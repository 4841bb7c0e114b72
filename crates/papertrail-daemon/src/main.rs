//! PaperTrail ingestion daemon.
//!
//! Resumes every import task persisted as running, runs the backfill worker
//! and drains both on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use papertrail_core::{defaults, BreakerConfig, ProgressBroadcaster};
use papertrail_db::Database;
use papertrail_inference::{
    AnalysisConfig, AnalysisGateway, EmbeddingGateway, HashEmbedder, OllamaBackend,
};
use papertrail_jobs::{
    BackfillConfig, BackfillWorker, EnrichmentPipeline, GraphConfig, GraphUpdater, HttpSource,
    ImportScheduler, PipelineConfig, SchedulerConfig, StatusReporter,
};

/// How long to wait for the backfill worker after signalling it.
const BACKFILL_JOIN_TIMEOUT_SECS: u64 = 10;

/// Default interval between status snapshots in the log.
const STATUS_LOG_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_logging();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/papertrail".to_string());
    let db = Database::connect(&database_url).await?;
    db.migrate().await?;
    info!(subsystem = "daemon", "Database ready");

    // Providers
    let ollama = Arc::new(OllamaBackend::from_env());
    let embeddings = Arc::new(EmbeddingGateway::new(
        ollama.clone(),
        Arc::new(HashEmbedder::new()),
        BreakerConfig::from_env("PAPERTRAIL_EMBED"),
    ));
    let analysis = Arc::new(AnalysisGateway::new(
        ollama.clone(),
        BreakerConfig::from_env("PAPERTRAIL_LLM"),
        AnalysisConfig::default(),
    ));
    if analysis.health_check().await {
        info!(subsystem = "daemon", model = analysis.model_name(), "Analysis provider reachable");
    } else {
        warn!(
            subsystem = "daemon",
            base_url = ollama.base_url(),
            "Analysis provider unreachable at startup, new items will get placeholders"
        );
    }

    // Workers
    let source = Arc::new(HttpSource::from_env()?);
    let progress = ProgressBroadcaster::new(defaults::PROGRESS_BUFFER);
    let graph = Arc::new(GraphUpdater::new(
        db.items.clone(),
        db.edges.clone(),
        GraphConfig::from_env(),
    ));
    let pipeline = Arc::new(EnrichmentPipeline::new(
        source.clone(),
        db.items.clone(),
        embeddings.clone(),
        analysis.clone(),
        graph,
        progress.clone(),
        PipelineConfig::from_env(),
    ));
    let scheduler = ImportScheduler::new(
        db.tasks.clone(),
        db.items.clone(),
        source,
        pipeline.clone(),
        progress.clone(),
        SchedulerConfig::from_env(),
    );
    let backfill = BackfillWorker::new(
        db.items.clone(),
        analysis.clone(),
        pipeline,
        progress.clone(),
        BackfillConfig::from_env(),
    )
    .start();

    spawn_progress_logger(&progress);
    spawn_status_logger(
        StatusReporter::new(embeddings, analysis, db.items.clone()),
        db.clone(),
    );

    let resumed = scheduler.resume_running().await?;
    info!(subsystem = "daemon", resumed, "PaperTrail daemon started");

    wait_for_signal().await;
    info!(subsystem = "daemon", "Shutdown requested");

    if !scheduler.shutdown().await {
        warn!(subsystem = "daemon", "Some import loops were abandoned mid-item");
    }
    if let Err(e) = backfill.shutdown().await {
        warn!(subsystem = "daemon", error = %e, "Backfill worker already stopped");
    }
    if tokio::time::timeout(
        Duration::from_secs(BACKFILL_JOIN_TIMEOUT_SECS),
        backfill.join(),
    )
    .await
    .is_err()
    {
        warn!(subsystem = "daemon", "Backfill worker did not stop in time");
    }
    db.pool.close().await;

    info!(subsystem = "daemon", "PaperTrail daemon stopped");
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "papertrail=info")
///
/// The returned guard must live until exit so buffered file output is flushed.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "papertrail_daemon=info,papertrail_jobs=info,papertrail_inference=info,\
         papertrail_db=info,papertrail_core=info"
            .into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("papertrail.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Mirror progress events into the debug log.
fn spawn_progress_logger(progress: &ProgressBroadcaster) {
    let mut events = Box::pin(progress.subscribe().into_stream());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            debug!(
                subsystem = "progress",
                subject = ?event.subject,
                stage = ?event.stage,
                percent = event.percent,
                message = event.message.as_deref().unwrap_or(""),
                "Progress"
            );
        }
    });
}

/// Log a health snapshot every `PAPERTRAIL_STATUS_LOG_SECS` seconds.
fn spawn_status_logger(reporter: StatusReporter, db: Database) {
    let every = std::env::var("PAPERTRAIL_STATUS_LOG_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(STATUS_LOG_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(every));
        loop {
            ticker.tick().await;
            match reporter.status().await {
                Ok(status) => info!(
                    subsystem = "status",
                    embedding_primary_available = status.embedding_primary_available,
                    llm_available = status.llm_available,
                    backfill_queue_size = status.backfill_queue_size,
                    "System status"
                ),
                Err(e) => warn!(subsystem = "status", error = %e, "Status snapshot failed"),
            }

            let pool = db.pool_stats();
            if pool.is_saturated() {
                warn!(
                    subsystem = "database",
                    component = "pool",
                    pool_size = pool.size,
                    "Connection pool saturated, store calls are queueing"
                );
            } else {
                debug!(
                    subsystem = "database",
                    component = "pool",
                    pool_size = pool.size,
                    pool_in_use = pool.in_use(),
                    "Pool occupancy"
                );
            }
        }
    });
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
