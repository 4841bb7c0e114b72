//! In-memory repository implementations.
//!
//! Used by tests and by embedded deployments without PostgreSQL. Each
//! operation holds the lock only for the duration of a map access, giving
//! the same per-record atomicity the PostgreSQL repositories provide.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::{CatalogRepository, EdgeRepository, ImportTaskRepository};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// CATALOG
// =============================================================================

#[derive(Default)]
pub struct InMemoryCatalog {
    items: Mutex<BTreeMap<String, CatalogItem>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CatalogRepository for InMemoryCatalog {
    async fn get(&self, id: &str) -> Result<Option<CatalogItem>> {
        Ok(lock(&self.items).get(id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(lock(&self.items).contains_key(id))
    }

    async fn insert(&self, item: &CatalogItem) -> Result<bool> {
        let mut items = lock(&self.items);
        if items.contains_key(&item.id) {
            return Ok(false);
        }
        items.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    async fn compare_and_put(
        &self,
        item: &CatalogItem,
        expected: EnrichmentStatus,
    ) -> Result<PutOutcome> {
        let mut items = lock(&self.items);
        let Some(stored) = items.get_mut(&item.id) else {
            return Ok(PutOutcome::NotFound);
        };
        let current = stored.status();
        if current != expected {
            return Ok(PutOutcome::StatusChanged(current));
        }
        let annotations = std::mem::take(&mut stored.annotations);
        let created_at = stored.created_at;
        *stored = item.clone();
        stored.annotations = annotations;
        stored.created_at = created_at;
        stored.updated_at = Utc::now();
        Ok(PutOutcome::Written)
    }

    async fn scan(&self, filter: ItemFilter) -> Result<Vec<CatalogItem>> {
        let items = lock(&self.items);
        let matching = items
            .values()
            .filter(|i| filter.status.map_or(true, |s| i.status() == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    async fn count_by_status(&self, status: EnrichmentStatus) -> Result<u64> {
        let items = lock(&self.items);
        Ok(items.values().filter(|i| i.status() == status).count() as u64)
    }

    async fn set_annotations(&self, id: &str, annotations: &ManualAnnotations) -> Result<bool> {
        let mut items = lock(&self.items);
        match items.get_mut(id) {
            Some(item) => {
                item.annotations = annotations.clone();
                item.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// =============================================================================
// EDGES
// =============================================================================

#[derive(Default)]
pub struct InMemoryEdges {
    edges: Mutex<BTreeMap<(String, String, EdgeKind), f32>>,
}

impl InMemoryEdges {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EdgeRepository for InMemoryEdges {
    async fn upsert(&self, edge: &RelationshipEdge) -> Result<()> {
        // Normalise again in case the caller built the struct by hand.
        let edge = RelationshipEdge::new(
            edge.item_a.clone(),
            edge.item_b.clone(),
            edge.kind,
            edge.weight,
        );
        lock(&self.edges).insert((edge.item_a, edge.item_b, edge.kind), edge.weight);
        Ok(())
    }

    async fn edges_for(&self, item_id: &str) -> Result<Vec<RelationshipEdge>> {
        let edges = lock(&self.edges);
        Ok(edges
            .iter()
            .filter(|((a, b, _), _)| a == item_id || b == item_id)
            .map(|((a, b, kind), w)| RelationshipEdge::new(a.clone(), b.clone(), *kind, *w))
            .collect())
    }

    async fn list(&self) -> Result<Vec<RelationshipEdge>> {
        let edges = lock(&self.edges);
        Ok(edges
            .iter()
            .map(|((a, b, kind), w)| RelationshipEdge::new(a.clone(), b.clone(), *kind, *w))
            .collect())
    }
}

// =============================================================================
// IMPORT TASKS
// =============================================================================

#[derive(Default)]
pub struct InMemoryTasks {
    tasks: Mutex<HashMap<Uuid, ImportTask>>,
}

impl InMemoryTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_task<R>(&self, id: Uuid, f: impl FnOnce(&mut ImportTask) -> R) -> Result<R> {
        let mut tasks = lock(&self.tasks);
        let task = tasks.get_mut(&id).ok_or(Error::TaskNotFound(id))?;
        Ok(f(task))
    }
}

#[async_trait]
impl ImportTaskRepository for InMemoryTasks {
    async fn create(&self, task: &ImportTask) -> Result<()> {
        validate_interval(task.interval_secs)?;
        let mut tasks = lock(&self.tasks);
        if tasks.contains_key(&task.id) {
            return Err(Error::InvalidInput(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImportTask>> {
        Ok(lock(&self.tasks).get(&id).cloned())
    }

    async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<ImportTask>> {
        let tasks = lock(&self.tasks);
        let mut out: Vec<ImportTask> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }

    async fn set_status(&self, id: Uuid, status: TaskStatus) -> Result<()> {
        self.with_task(id, |t| t.status = status)
    }

    async fn record_item(&self, id: Uuid, imported: bool) -> Result<()> {
        self.with_task(id, |t| {
            t.attempted_total += 1;
            if imported {
                t.imported_total += 1;
            }
        })
    }

    async fn finish_cycle(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_task(id, |t| t.last_run_at = Some(at))
    }

    async fn append_log(&self, id: Uuid, entry: TaskLogEntry) -> Result<()> {
        self.with_task(id, |t| {
            push_bounded(&mut t.log_tail, entry, defaults::TASK_LOG_TAIL)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn item(id: &str) -> CatalogItem {
        CatalogItem::new(
            id,
            SourceMetadata {
                title: format!("Item {}", id),
                authors: vec!["A".into()],
                categories: BTreeSet::new(),
                abstract_text: None,
                published_at: Utc::now(),
                external_url: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_insert_is_first_writer_wins() {
        let repo = InMemoryCatalog::new();
        let mut a = item("x");
        a.enrichment = Enrichment::all_placeholder();
        assert!(repo.insert(&a).await.unwrap());
        assert!(!repo.insert(&item("x")).await.unwrap());
        assert_eq!(
            repo.get("x").await.unwrap().unwrap().status(),
            EnrichmentStatus::Placeholder
        );
    }

    #[tokio::test]
    async fn test_compare_and_put_preserves_annotations() {
        let repo = InMemoryCatalog::new();
        let mut stored = item("x");
        stored.enrichment = Enrichment::all_placeholder();
        repo.insert(&stored).await.unwrap();

        let notes = ManualAnnotations {
            starred: true,
            read_status: ReadStatus::Reading,
            user_notes: "look at section 3".into(),
        };
        repo.set_annotations("x", &notes).await.unwrap();

        // Writer still holds the pre-annotation snapshot.
        let mut update = stored.clone();
        update.enrichment = Enrichment::from_fields(AnalysisFields {
            summary: "s".into(),
            key_contributions: vec!["k".into()],
            keywords: BTreeSet::from(["w".to_string()]),
        });
        let outcome = repo
            .compare_and_put(&update, EnrichmentStatus::Placeholder)
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Written);

        let got = repo.get("x").await.unwrap().unwrap();
        assert_eq!(got.status(), EnrichmentStatus::Complete);
        assert_eq!(got.annotations, notes);
    }

    #[tokio::test]
    async fn test_compare_and_put_rejects_stale_status() {
        let repo = InMemoryCatalog::new();
        let mut stored = item("x");
        stored.enrichment = Enrichment::all_placeholder();
        repo.insert(&stored).await.unwrap();

        let outcome = repo
            .compare_and_put(&stored, EnrichmentStatus::Failed)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PutOutcome::StatusChanged(EnrichmentStatus::Placeholder)
        );
        assert_eq!(
            repo.compare_and_put(&item("missing"), EnrichmentStatus::Pending)
                .await
                .unwrap(),
            PutOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_scan_and_count_by_status() {
        let repo = InMemoryCatalog::new();
        for id in ["a", "b", "c"] {
            let mut i = item(id);
            i.enrichment = Enrichment::all_placeholder();
            repo.insert(&i).await.unwrap();
        }
        let mut failed = item("d");
        failed.enrichment = Enrichment::failed("empty");
        repo.insert(&failed).await.unwrap();

        let placeholders = repo
            .scan(ItemFilter::with_status(EnrichmentStatus::Placeholder).limit(2))
            .await
            .unwrap();
        assert_eq!(placeholders.len(), 2);
        assert_eq!(
            repo.count_by_status(EnrichmentStatus::Placeholder)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            repo.count_by_status(EnrichmentStatus::Failed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_edge_upsert_overwrites_weight() {
        let repo = InMemoryEdges::new();
        repo.upsert(&RelationshipEdge::new("a", "b", EdgeKind::SharedAuthor, 0.2))
            .await
            .unwrap();
        repo.upsert(&RelationshipEdge::new("b", "a", EdgeKind::SharedAuthor, 0.6))
            .await
            .unwrap();
        repo.upsert(&RelationshipEdge::new("a", "b", EdgeKind::TopicSimilarity, 0.9))
            .await
            .unwrap();

        let edges = repo.list().await.unwrap();
        assert_eq!(edges.len(), 2);
        let shared = edges
            .iter()
            .find(|e| e.kind == EdgeKind::SharedAuthor)
            .unwrap();
        assert!((shared.weight - 0.6).abs() < 1e-6);
        assert_eq!(repo.edges_for("b").await.unwrap().len(), 2);
        assert!(repo.edges_for("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_counters_and_log() {
        let repo = InMemoryTasks::new();
        let task = ImportTask::new("t", ImportFilter::default(), 60).unwrap();
        repo.create(&task).await.unwrap();

        repo.record_item(task.id, true).await.unwrap();
        repo.record_item(task.id, false).await.unwrap();
        for i in 0..(defaults::TASK_LOG_TAIL + 1) {
            repo.append_log(task.id, TaskLogEntry::info(format!("{}", i)))
                .await
                .unwrap();
        }
        let got = repo.get(task.id).await.unwrap().unwrap();
        assert_eq!(got.attempted_total, 2);
        assert_eq!(got.imported_total, 1);
        assert_eq!(got.log_tail.len(), defaults::TASK_LOG_TAIL);
    }

    #[tokio::test]
    async fn test_task_list_filters_status() {
        let repo = InMemoryTasks::new();
        let a = ImportTask::new("a", ImportFilter::default(), 60).unwrap();
        let b = ImportTask::new("b", ImportFilter::default(), 60)
            .unwrap()
            .running();
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        let running = repo.list(Some(TaskStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, b.id);
        assert_eq!(repo.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_task_errors() {
        let repo = InMemoryTasks::new();
        let err = repo
            .set_status(Uuid::nil(), TaskStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }
}
