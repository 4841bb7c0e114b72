//! Continuous import scheduler.
//!
//! Each running import task owns one tokio loop that polls its source on a
//! fixed interval and feeds new items through the [`EnrichmentPipeline`].
//! Loops are tracked in a registry keyed by task id, each with a `watch`
//! cancellation signal. A per-task single-flight lock guarantees that at
//! most one poll cycle of a task runs at a time; an overlapping trigger is
//! skipped, not queued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use papertrail_core::{
    defaults, sort_newest_first, CatalogRepository, Error, ImportTask, ImportTaskRepository,
    ProgressBroadcaster, ProgressEvent, ProgressStage, Result, SortOrder, SourceQuery,
    TaskLogEntry, TaskStatus,
};

use crate::pipeline::{EnrichmentPipeline, IngestOutcome};
use crate::{env_u64, store_call};

/// Configuration for the import scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Deadline for one source query.
    pub source_timeout: Duration,
    /// How long shutdown waits for loops to finish their current item.
    pub drain_timeout: Duration,
    /// Deadline for task repository calls.
    pub store_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(defaults::SOURCE_QUERY_TIMEOUT_SECS),
            drain_timeout: Duration::from_secs(defaults::SHUTDOWN_DRAIN_SECS),
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PAPERTRAIL_SOURCE_TIMEOUT_SECS` | `30` | Source query deadline |
    /// | `PAPERTRAIL_DRAIN_TIMEOUT_SECS` | `30` | Shutdown drain budget |
    /// | `PAPERTRAIL_STORE_TIMEOUT_SECS` | `10` | Task store call deadline |
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            source_timeout: env_u64("PAPERTRAIL_SOURCE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.source_timeout),
            drain_timeout: env_u64("PAPERTRAIL_DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.drain_timeout),
            store_timeout: env_u64("PAPERTRAIL_STORE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.store_timeout),
        }
    }

    pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
        self.source_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub task_id: Uuid,
    /// Another cycle of the same task was already running.
    pub skipped: bool,
    /// Stop was observed between items.
    pub cancelled: bool,
    /// Source query failure that ended the cycle early.
    pub aborted: Option<String>,
    pub discovered: usize,
    pub already_known: usize,
    pub attempted: usize,
    pub imported: usize,
    pub errors: usize,
}

impl CycleReport {
    fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            ..Self::default()
        }
    }

    fn summary(&self) -> String {
        format!(
            "cycle finished: {} discovered, {} known, {} imported, {} errors",
            self.discovered, self.already_known, self.imported, self.errors
        )
    }
}

struct RunningTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SchedulerInner {
    tasks: Arc<dyn ImportTaskRepository>,
    catalog: Arc<dyn CatalogRepository>,
    source: Arc<dyn SourceQuery>,
    pipeline: Arc<EnrichmentPipeline>,
    progress: ProgressBroadcaster,
    config: SchedulerConfig,
    registry: Mutex<HashMap<Uuid, RunningTask>>,
    flights: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owns the set of running import loops.
#[derive(Clone)]
pub struct ImportScheduler {
    inner: Arc<SchedulerInner>,
}

impl ImportScheduler {
    pub fn new(
        tasks: Arc<dyn ImportTaskRepository>,
        catalog: Arc<dyn CatalogRepository>,
        source: Arc<dyn SourceQuery>,
        pipeline: Arc<EnrichmentPipeline>,
        progress: ProgressBroadcaster,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks,
                catalog,
                source,
                pipeline,
                progress,
                config,
                registry: Mutex::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Mark a task running and start its loop.
    ///
    /// Returns once the status is durably recorded. Starting a task whose
    /// loop is already alive only re-records the status.
    #[instrument(skip(self), fields(subsystem = "scheduler", op = "start"))]
    pub async fn start(&self, task_id: Uuid) -> Result<()> {
        let task = self.inner.load_task(task_id).await?;
        self.inner
            .store("set_status", self.inner.tasks.set_status(task_id, TaskStatus::Running))
            .await?;

        if self.spawn_loop(&task) {
            info!(task_id = %task_id, interval_secs = task.interval_secs, "Import task started");
            self.inner
                .progress
                .publish(ProgressEvent::task(task_id, ProgressStage::TaskStarted));
        }
        Ok(())
    }

    /// Mark a task stopped and signal its loop.
    ///
    /// Returns once the status is durably recorded. The loop finishes the
    /// item it is processing and then exits; use [`wait_idle`](Self::wait_idle)
    /// to wait for that.
    #[instrument(skip(self), fields(subsystem = "scheduler", op = "stop"))]
    pub async fn stop(&self, task_id: Uuid) -> Result<()> {
        self.inner.load_task(task_id).await?;
        self.inner
            .store("set_status", self.inner.tasks.set_status(task_id, TaskStatus::Stopped))
            .await?;

        if let Some(running) = self.inner.registry().remove(&task_id) {
            let _ = running.cancel.send(true);
            info!(task_id = %task_id, "Import task stop requested");
        }
        self.inner
            .progress
            .publish(ProgressEvent::task(task_id, ProgressStage::TaskStopped));
        Ok(())
    }

    /// Start loops for every task persisted as running.
    ///
    /// Safe to call repeatedly: tasks with a live loop are left alone.
    #[instrument(skip(self), fields(subsystem = "scheduler", op = "resume_running"))]
    pub async fn resume_running(&self) -> Result<usize> {
        let running = self
            .inner
            .store("list", self.inner.tasks.list(Some(TaskStatus::Running)))
            .await?;
        let mut resumed = 0;
        for task in &running {
            if self.spawn_loop(task) {
                resumed += 1;
            }
        }
        info!(resumed, persisted_running = running.len(), "Resumed import tasks");
        Ok(resumed)
    }

    /// Run one poll cycle immediately, outside the timer.
    ///
    /// Respects the single-flight invariant: if a cycle of this task is in
    /// progress the returned report has `skipped` set.
    pub async fn run_cycle_now(&self, task_id: Uuid) -> Result<CycleReport> {
        let cancel = self.inner.registry().get(&task_id).map(|r| r.cancel.subscribe());
        match cancel {
            Some(rx) => self.inner.run_cycle(task_id, &rx).await,
            None => {
                let (_tx, rx) = watch::channel(false);
                self.inner.run_cycle(task_id, &rx).await
            }
        }
    }

    /// Wait until no cycle of the task is running.
    pub async fn wait_idle(&self, task_id: Uuid) {
        let flight = self.inner.flight(task_id);
        let _guard = flight.lock().await;
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.inner
            .registry()
            .get(&task_id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Ids of tasks with a live loop.
    pub fn running_tasks(&self) -> Vec<Uuid> {
        self.inner
            .registry()
            .iter()
            .filter(|(_, r)| !r.handle.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Signal every loop and wait up to the configured drain timeout.
    ///
    /// Persisted task status is left untouched so running tasks resume on
    /// the next start. Returns `true` if every loop exited in time.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(self.inner.config.drain_timeout)
            .await
    }

    #[instrument(skip(self), fields(subsystem = "scheduler", op = "shutdown"))]
    pub async fn shutdown_with_timeout(&self, drain: Duration) -> bool {
        let running: Vec<(Uuid, RunningTask)> = self.inner.registry().drain().collect();
        if running.is_empty() {
            return true;
        }

        info!(count = running.len(), drain_secs = drain.as_secs(), "Draining import loops");
        let mut handles = Vec::with_capacity(running.len());
        for (_, task) in running {
            let _ = task.cancel.send(true);
            handles.push(task.handle);
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(drain, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!("Import loops drained");
                true
            }
            Err(_) => {
                warn!("Drain timeout elapsed, abandoning in-flight items");
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }

    /// Spawn the loop for a task unless one is alive. Returns whether a loop
    /// was spawned.
    fn spawn_loop(&self, task: &ImportTask) -> bool {
        let mut registry = self.inner.registry();
        if registry
            .get(&task.id)
            .is_some_and(|r| !r.handle.is_finished())
        {
            debug!(task_id = %task.id, "Loop already running");
            return false;
        }

        let (cancel, rx) = watch::channel(false);
        let inner = self.inner.clone();
        let task_id = task.id;
        let interval = Duration::from_secs(task.interval_secs);
        let handle = tokio::spawn(async move { inner.run_loop(task_id, interval, rx).await });
        registry.insert(task_id, RunningTask { cancel, handle });
        true
    }
}

impl SchedulerInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, RunningTask>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flight(&self, task_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap_or_else(|e| e.into_inner());
        flights.entry(task_id).or_default().clone()
    }

    async fn store<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        store_call(op, self.config.store_timeout, fut).await
    }

    async fn load_task(&self, task_id: Uuid) -> Result<ImportTask> {
        self.store("get", self.tasks.get(task_id))
            .await?
            .ok_or(Error::TaskNotFound(task_id))
    }

    /// Append to the task log; a failed append is logged, not propagated.
    async fn log(&self, task_id: Uuid, entry: TaskLogEntry) {
        if let Err(e) = self.store("append_log", self.tasks.append_log(task_id, entry)).await {
            warn!(task_id = %task_id, error = %e, "Failed to append task log");
        }
    }

    #[instrument(skip(self, cancel), fields(subsystem = "scheduler", op = "run_loop"))]
    async fn run_loop(self: Arc<Self>, task_id: Uuid, interval: Duration, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                // Fires on stop or when the registry entry is dropped.
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }
            if *cancel.borrow() {
                break;
            }

            match self.run_cycle(task_id, &cancel).await {
                Ok(report) if report.cancelled => break,
                Ok(_) => {}
                Err(Error::TaskNotFound(_)) => {
                    warn!(task_id = %task_id, "Task no longer exists, ending loop");
                    break;
                }
                Err(e) if !e.is_fatal() => {
                    warn!(task_id = %task_id, error = %e, "Poll cycle aborted, retrying next interval");
                    self.log(task_id, TaskLogEntry::warn(format!("cycle aborted: {}", e))).await;
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Record store unusable, ending import loop");
                    self.halt(task_id, &e).await;
                    break;
                }
            }
        }
        info!(task_id = %task_id, "Import loop exited");
    }

    #[instrument(skip(self, cancel), fields(subsystem = "scheduler", op = "run_cycle"))]
    async fn run_cycle(&self, task_id: Uuid, cancel: &watch::Receiver<bool>) -> Result<CycleReport> {
        let flight = self.flight(task_id);
        let Ok(_guard) = flight.try_lock() else {
            debug!(task_id = %task_id, "Previous cycle still running, skipping");
            self.progress.publish(ProgressEvent::task(task_id, ProgressStage::CycleSkipped));
            return Ok(CycleReport {
                skipped: true,
                ..CycleReport::new(task_id)
            });
        };

        let start = Instant::now();
        let task = self.load_task(task_id).await?;
        let mut report = CycleReport::new(task_id);
        self.progress.publish(ProgressEvent::task(task_id, ProgressStage::CycleStarted));

        let queried = tokio::time::timeout(
            self.config.source_timeout,
            self.source.query(&task.filter, SortOrder::NewestFirst),
        )
        .await;
        let mut refs = match queried {
            Ok(Ok(refs)) => refs,
            Ok(Err(e)) => return self.abort_cycle(report, format!("source query failed: {}", e)).await,
            Err(_) => {
                let msg = format!(
                    "source query timed out after {}s",
                    self.config.source_timeout.as_secs()
                );
                return self.abort_cycle(report, msg).await;
            }
        };

        sort_newest_first(&mut refs);
        let mut seen = HashSet::new();
        refs.retain(|r| seen.insert(r.id.clone()));
        report.discovered = refs.len();
        debug!(result_count = refs.len(), "Source query returned");

        let total = refs.len().max(1);
        for (idx, item_ref) in refs.iter().enumerate() {
            if *cancel.borrow() {
                info!(task_id = %task_id, processed = idx, "Stop observed between items");
                report.cancelled = true;
                break;
            }

            let known = self
                .store("exists", self.catalog.exists(&item_ref.id))
                .await
                .map_err(|e| self.store_failed(task_id, e));
            if known? {
                report.already_known += 1;
                continue;
            }

            report.attempted += 1;
            let outcome = self.pipeline.ingest(item_ref).await;
            let imported = match outcome {
                Ok(IngestOutcome::Stored(item)) => {
                    report.imported += 1;
                    self.log(
                        task_id,
                        TaskLogEntry::info(format!("imported {} ({})", item.id, item.status())),
                    )
                    .await;
                    true
                }
                Ok(IngestOutcome::Duplicate(_)) => {
                    report.attempted -= 1;
                    report.already_known += 1;
                    continue;
                }
                Ok(IngestOutcome::FetchFailed(msg)) => {
                    report.errors += 1;
                    self.log(
                        task_id,
                        TaskLogEntry::warn(format!("{}: fetch failed: {}", item_ref.id, msg)),
                    )
                    .await;
                    false
                }
                Err(e) if e.is_fatal() => return Err(self.store_failed(task_id, e)),
                Err(e) => {
                    report.errors += 1;
                    self.log(
                        task_id,
                        TaskLogEntry::warn(format!("{}: {}", item_ref.id, e)),
                    )
                    .await;
                    false
                }
            };

            self.store("record_item", self.tasks.record_item(task_id, imported))
                .await
                .map_err(|e| self.store_failed(task_id, e))?;

            let percent = (((idx + 1) * 100) / total).min(100) as u8;
            self.progress.publish(
                ProgressEvent::task(task_id, ProgressStage::Persist)
                    .with_percent(percent)
                    .with_message(format!("{}/{}", idx + 1, refs.len())),
            );
        }

        self.store("finish_cycle", self.tasks.finish_cycle(task_id, Utc::now()))
            .await
            .map_err(|e| self.store_failed(task_id, e))?;
        self.log(task_id, TaskLogEntry::info(report.summary())).await;

        info!(
            task_id = %task_id,
            discovered = report.discovered,
            imported = report.imported,
            errors = report.errors,
            duration_ms = start.elapsed().as_millis() as u64,
            "Poll cycle finished"
        );
        self.progress.publish(
            ProgressEvent::task(task_id, ProgressStage::CycleFinished).with_message(report.summary()),
        );
        Ok(report)
    }

    /// End a cycle after a source failure. The task stays running.
    async fn abort_cycle(&self, mut report: CycleReport, msg: String) -> Result<CycleReport> {
        let task_id = report.task_id;
        warn!(task_id = %task_id, error = %msg, "Poll cycle aborted");
        self.log(task_id, TaskLogEntry::error(msg.clone())).await;
        if let Err(e) = self
            .store("finish_cycle", self.tasks.finish_cycle(task_id, Utc::now()))
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to stamp aborted cycle");
        }
        self.progress.publish(
            ProgressEvent::task(task_id, ProgressStage::CycleFailed).with_message(msg.clone()),
        );
        report.aborted = Some(msg);
        Ok(report)
    }

    /// Report a store failure that ends the current cycle.
    fn store_failed(&self, task_id: Uuid, e: Error) -> Error {
        if e.is_fatal() {
            error!(task_id = %task_id, error = %e, "Record store failure, aborting cycle");
        } else {
            warn!(task_id = %task_id, error = %e, "Record store call timed out, aborting cycle");
        }
        self.progress.publish(
            ProgressEvent::task(task_id, ProgressStage::CycleFailed).with_message(e.to_string()),
        );
        e
    }

    /// Record that a loop ended on a fatal store error. Best effort: the
    /// store that just failed may reject these writes too.
    async fn halt(&self, task_id: Uuid, e: &Error) {
        self.log(task_id, TaskLogEntry::error(format!("loop stopped: {}", e))).await;
        if let Err(persist) = self
            .store("set_status", self.tasks.set_status(task_id, TaskStatus::Stopped))
            .await
        {
            warn!(task_id = %task_id, error = %persist, "Could not persist stopped status");
        }
        self.progress.publish(
            ProgressEvent::task(task_id, ProgressStage::TaskStopped).with_message(e.to_string()),
        );
    }
}
