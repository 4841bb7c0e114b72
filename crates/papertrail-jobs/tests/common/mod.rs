//! Shared fixtures for the papertrail-jobs integration tests.
//!
//! Everything runs in memory: a scripted item source, an embedder that maps
//! titles to fixed vectors, and a generator that can be switched off to
//! simulate a provider outage.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use papertrail_inference::{AnalysisConfig, AnalysisGateway, EmbeddingGateway, HashEmbedder};
use papertrail_jobs::{
    BreakerConfig, ContentSource, EmbeddingBackend, EnrichmentPipeline, Error, GenerationBackend,
    GraphConfig, GraphUpdater, ImportFilter, ImportScheduler, ImportTask, ImportTaskRepository,
    InMemoryCatalog, InMemoryEdges, InMemoryTasks, PipelineConfig, ProgressBroadcaster, Result,
    SchedulerConfig, SortOrder, SourceItemRef, SourceMetadata, SourceQuery,
};

pub const ANALYSIS_JSON: &str = r#"{"summary": "A concise summary.", "key_contributions": ["A new method"], "keywords": ["attention", "graphs"]}"#;

const ONE_HOT_DIM: usize = 64;

pub fn published(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

// =============================================================================
// SOURCE
// =============================================================================

#[derive(Clone)]
pub struct SourceEntry {
    pub item_ref: SourceItemRef,
    pub metadata: SourceMetadata,
    pub content: Option<String>,
}

pub fn entry(id: &str, day: u32, authors: &[&str]) -> SourceEntry {
    SourceEntry {
        item_ref: SourceItemRef {
            id: id.to_string(),
            published_at: published(day),
        },
        metadata: SourceMetadata {
            title: format!("Title {}", id),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            categories: ["cs.LG".to_string()].into_iter().collect(),
            abstract_text: Some(format!("Abstract of {}.", id)),
            published_at: published(day),
            external_url: format!("https://example.org/abs/{}", id),
        },
        content: Some(format!("Full text of {}.", id)),
    }
}

#[derive(Default)]
pub struct MockSource {
    entries: Mutex<Vec<SourceEntry>>,
    query_delay: Mutex<Duration>,
    fetch_delay: Mutex<Duration>,
    failing: Mutex<Vec<String>>,
    query_down: AtomicBool,
    pub query_calls: AtomicUsize,
    fetches: Mutex<HashMap<String, usize>>,
}

impl MockSource {
    pub fn new(entries: Vec<SourceEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }

    pub fn push(&self, entry: SourceEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.query_delay.lock().unwrap() = delay;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn set_query_down(&self, down: bool) {
        self.query_down.store(down, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, id: &str) {
        self.failing.lock().unwrap().push(id.to_string());
    }

    pub fn fetch_count(&self, id: &str) -> usize {
        self.fetches.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    fn lookup(&self, id: &str) -> Option<SourceEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.item_ref.id == id)
            .cloned()
    }
}

#[async_trait]
impl SourceQuery for MockSource {
    async fn query(&self, _filter: &ImportFilter, _order: SortOrder) -> Result<Vec<SourceItemRef>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.query_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.query_down.load(Ordering::SeqCst) {
            return Err(Error::Source("HTTP 502 from upstream".into()));
        }
        // Deliberately unsorted; the scheduler orders results itself.
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.item_ref.clone())
            .collect())
    }
}

#[async_trait]
impl ContentSource for MockSource {
    async fn fetch_metadata(&self, item: &SourceItemRef) -> Result<SourceMetadata> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(item.id.clone())
            .or_insert(0) += 1;
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&item.id) {
            return Err(Error::Source(format!("HTTP 503 for {}", item.id)));
        }
        self.lookup(&item.id)
            .map(|e| e.metadata)
            .ok_or_else(|| Error::Source(format!("unknown item {}", item.id)))
    }

    async fn fetch_content(&self, item: &SourceItemRef) -> Result<String> {
        self.lookup(&item.id)
            .and_then(|e| e.content)
            .ok_or_else(|| Error::Source(format!("no content for {}", item.id)))
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Returns the vector registered for the first title prefix the text
/// starts with. Unregistered titles get distinct one-hot vectors, so they
/// never look similar to anything.
pub struct ScriptedEmbedder {
    vectors: Mutex<Vec<(String, Vec<f32>)>>,
    one_hot: Mutex<HashMap<String, usize>>,
    down: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self {
            vectors: Mutex::new(Vec::new()),
            one_hot: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_vector(&self, id: &str, vector: Vec<f32>) {
        self.vectors
            .lock()
            .unwrap()
            .push((format!("Title {}\n", id), vector));
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingBackend for ScriptedEmbedder {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Embedding("connection refused".into()));
        }
        let vectors = self.vectors.lock().unwrap();
        let mut one_hot = self.one_hot.lock().unwrap();
        Ok(texts
            .iter()
            .map(|t| {
                if let Some((_, v)) = vectors.iter().find(|(p, _)| t.starts_with(p.as_str())) {
                    return v.clone();
                }
                let title = t.lines().next().unwrap_or_default().to_string();
                let next = one_hot.len();
                let slot = *one_hot.entry(title).or_insert(next);
                let mut v = vec![0.0; ONE_HOT_DIM];
                v[slot % ONE_HOT_DIM] = 1.0;
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "scripted-embed"
    }
}

pub struct ScriptedGenerator {
    down: AtomicBool,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            down: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGenerator {
    async fn generate_with_system(&self, _system: &str, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Inference("HTTP 503 from provider".into()));
        }
        Ok(ANALYSIS_JSON.to_string())
    }

    fn model_name(&self) -> &str {
        "scripted-gen"
    }
}

// =============================================================================
// HARNESS
// =============================================================================

pub struct Harness {
    pub source: Arc<MockSource>,
    pub catalog: Arc<InMemoryCatalog>,
    pub edges: Arc<InMemoryEdges>,
    pub tasks: Arc<InMemoryTasks>,
    pub embedder: Arc<ScriptedEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub embeddings: Arc<EmbeddingGateway>,
    pub analysis: Arc<AnalysisGateway>,
    pub graph: Arc<GraphUpdater>,
    pub pipeline: Arc<EnrichmentPipeline>,
    pub scheduler: ImportScheduler,
    pub progress: ProgressBroadcaster,
}

impl Harness {
    pub fn new(entries: Vec<SourceEntry>) -> Self {
        Self::with_breaker(entries, BreakerConfig::default())
    }

    pub fn with_breaker(entries: Vec<SourceEntry>, breaker: BreakerConfig) -> Self {
        let source = Arc::new(MockSource::new(entries));
        let catalog = Arc::new(InMemoryCatalog::new());
        let edges = Arc::new(InMemoryEdges::new());
        let tasks = Arc::new(InMemoryTasks::new());
        let embedder = Arc::new(ScriptedEmbedder::new());
        let generator = Arc::new(ScriptedGenerator::new());
        let progress = ProgressBroadcaster::new(1024);

        let embeddings = Arc::new(EmbeddingGateway::new(
            embedder.clone(),
            Arc::new(HashEmbedder::new()),
            breaker.clone(),
        ));
        let analysis = Arc::new(AnalysisGateway::new(
            generator.clone(),
            breaker,
            AnalysisConfig::default(),
        ));
        let graph = Arc::new(GraphUpdater::new(
            catalog.clone(),
            edges.clone(),
            GraphConfig::default(),
        ));
        let pipeline = Arc::new(EnrichmentPipeline::new(
            source.clone(),
            catalog.clone(),
            embeddings.clone(),
            analysis.clone(),
            graph.clone(),
            progress.clone(),
            PipelineConfig::default(),
        ));
        let scheduler = ImportScheduler::new(
            tasks.clone(),
            catalog.clone(),
            source.clone(),
            pipeline.clone(),
            progress.clone(),
            SchedulerConfig::default(),
        );

        Self {
            source,
            catalog,
            edges,
            tasks,
            embedder,
            generator,
            embeddings,
            analysis,
            graph,
            pipeline,
            scheduler,
            progress,
        }
    }

    /// Persist a stopped task with the minimum interval.
    pub async fn create_task(&self, name: &str) -> ImportTask {
        let task = ImportTask::new(name, ImportFilter::default(), 30).unwrap();
        self.tasks.create(&task).await.unwrap();
        task
    }
}
