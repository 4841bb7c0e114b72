//! Integration tests for provider degradation and recovery.
//!
//! Validates:
//! - Analysis outages produce placeholder items, never failed ones
//! - The backfill worker does nothing while the breaker rejects calls
//! - After the cooldown the probe succeeds and placeholders complete
//! - Backfill writes never clobber annotations made in the meantime
//! - A failed probe stops the batch early
//! - Shutdown interrupts a batch between items
//! - The status snapshot tracks both breakers and the backfill queue

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{entry, Harness};
use papertrail_jobs::{
    BackfillConfig, BackfillWorker, BreakerConfig, BreakerState, CatalogRepository,
    EdgeRepository, EnrichmentStatus, ItemFilter, ManualAnnotations, ReadStatus, StatusReporter,
};

fn breaker(threshold: u32) -> BreakerConfig {
    BreakerConfig::default()
        .with_failure_threshold(threshold)
        .with_cooldown(Duration::from_secs(30), Duration::from_secs(120))
}

fn worker(h: &Harness, config: BackfillConfig) -> BackfillWorker {
    BackfillWorker::new(
        h.catalog.clone(),
        h.analysis.clone(),
        h.pipeline.clone(),
        h.progress.clone(),
        config,
    )
}

fn reporter(h: &Harness) -> StatusReporter {
    StatusReporter::new(h.embeddings.clone(), h.analysis.clone(), h.catalog.clone())
}

#[tokio::test(start_paused = true)]
async fn test_outage_round_trip_preserves_annotations() {
    let h = Harness::with_breaker(
        vec![
            entry("A", 1, &["Ada"]),
            entry("B", 2, &["Ada"]),
            entry("C", 3, &["Grace"]),
        ],
        breaker(2),
    );
    h.generator.set_down(true);
    let task = h.create_task("outage").await;

    let report = h.scheduler.run_cycle_now(task.id).await.unwrap();
    assert_eq!(report.imported, 3);
    // Two failures open the breaker; the third item never reaches the provider.
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.analysis.breaker().state(), BreakerState::Open);

    let placeholders = h
        .catalog
        .scan(ItemFilter::with_status(EnrichmentStatus::Placeholder))
        .await
        .unwrap();
    assert_eq!(placeholders.len(), 3);
    assert!(h.edges.list().await.unwrap().is_empty());

    let status = reporter(&h).status().await.unwrap();
    assert!(!status.llm_available);
    assert!(status.embedding_primary_available);
    assert_eq!(status.backfill_queue_size, 3);

    let notes = ManualAnnotations {
        starred: true,
        read_status: ReadStatus::Reading,
        user_notes: "check the ablations".to_string(),
    };
    assert!(h.catalog.set_annotations("B", &notes).await.unwrap());

    let backfill = worker(&h, BackfillConfig::default());
    let skipped = backfill.run_cycle().await.unwrap();
    assert!(skipped.skipped_unavailable);
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);

    h.generator.set_down(false);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(reporter(&h).status().await.unwrap().llm_available);

    let report = backfill.run_cycle().await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(h.analysis.breaker().state(), BreakerState::Closed);

    let b = h.catalog.get("B").await.unwrap().unwrap();
    assert_eq!(b.status(), EnrichmentStatus::Complete);
    assert_eq!(b.annotations, notes);

    let edges = h.edges.list().await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!((edges[0].item_a.as_str(), edges[0].item_b.as_str()), ("A", "B"));

    let status = reporter(&h).status().await.unwrap();
    assert_eq!(status.backfill_queue_size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_stops_batch() {
    let h = Harness::with_breaker(
        vec![
            entry("A", 1, &["Ada"]),
            entry("B", 2, &["Grace"]),
            entry("C", 3, &["Alan"]),
        ],
        breaker(1),
    );
    h.generator.set_down(true);
    let task = h.create_task("down").await;
    h.scheduler.run_cycle_now(task.id).await.unwrap();
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let report = worker(&h, BackfillConfig::default())
        .run_cycle()
        .await
        .unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.completed, 0);
    assert_eq!(report.still_placeholder, 1);
    assert_eq!(h.generator.calls.load(Ordering::SeqCst), 2);
    // Reopened with a doubled cooldown.
    assert_eq!(h.analysis.breaker().state(), BreakerState::Open);
    assert_eq!(h.analysis.breaker().current_cooldown(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_batch_size_limits_cycle() {
    let h = Harness::new(vec![
        entry("A", 1, &["Ada"]),
        entry("B", 2, &["Grace"]),
        entry("C", 3, &["Alan"]),
    ]);
    h.generator.set_down(true);
    let task = h.create_task("batch").await;
    h.scheduler.run_cycle_now(task.id).await.unwrap();
    h.generator.set_down(false);
    tokio::time::advance(Duration::from_secs(31)).await;

    let backfill = worker(&h, BackfillConfig::default().with_batch_size(2));
    let report = backfill.run_cycle().await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(reporter(&h).status().await.unwrap().backfill_queue_size, 1);
}

#[tokio::test(start_paused = true)]
async fn test_worker_loop_backfills_and_shuts_down() {
    let h = Harness::new(vec![entry("A", 1, &["Ada"])]);
    h.generator.set_down(true);
    h.pipeline
        .ingest(&entry("A", 1, &["Ada"]).item_ref)
        .await
        .unwrap();
    h.generator.set_down(false);

    let handle = worker(
        &h,
        BackfillConfig::default().with_interval(Duration::from_secs(60)),
    )
    .start();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let item = h.catalog.get("A").await.unwrap().unwrap();
    assert_eq!(item.status(), EnrichmentStatus::Complete);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("worker did not stop");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_batch_between_items() {
    let h = Harness::new(vec![
        entry("A", 1, &["Ada"]),
        entry("B", 2, &["Grace"]),
        entry("C", 3, &["Alan"]),
    ]);
    h.generator.set_down(true);
    let task = h.create_task("slow backfill").await;
    h.scheduler.run_cycle_now(task.id).await.unwrap();
    h.generator.set_down(false);
    tokio::time::advance(Duration::from_secs(31)).await;
    h.generator.set_delay(Duration::from_secs(5));

    let handle = worker(
        &h,
        BackfillConfig::default().with_interval(Duration::from_secs(60)),
    )
    .start();
    // The batch starts at 60s and the first analysis ends at 65s.
    tokio::time::sleep(Duration::from_secs(62)).await;
    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(30), handle.join())
        .await
        .expect("worker did not stop");

    assert_eq!(reporter(&h).status().await.unwrap().backfill_queue_size, 2);
}

#[tokio::test]
async fn test_disabled_worker_exits_immediately() {
    let h = Harness::new(Vec::new());
    let handle = worker(&h, BackfillConfig::default().with_enabled(false)).start();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("disabled worker kept running");
}

#[tokio::test]
async fn test_status_reports_embedding_breaker() {
    let h = Harness::new(vec![
        entry("A", 1, &["Ada"]),
        entry("B", 2, &["Grace"]),
        entry("C", 3, &["Alan"]),
    ]);
    h.embedder.set_down(true);
    let task = h.create_task("fallback").await;
    h.scheduler.run_cycle_now(task.id).await.unwrap();

    let status = reporter(&h).status().await.unwrap();
    assert!(!status.embedding_primary_available);
    assert!(status.llm_available);
    assert_eq!(status.backfill_queue_size, 0);
    // Every item still got a vector.
    for item in h.catalog.scan(ItemFilter::default()).await.unwrap() {
        assert!(item.embedding.is_some());
    }
}
