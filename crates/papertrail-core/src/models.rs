//! Core data models for the PaperTrail ingestion core.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Error, Result};

// =============================================================================
// ENRICHMENT
// =============================================================================

/// One LLM-derived field of a catalog item.
///
/// A field is either not computed yet, parked behind a placeholder while the
/// analysis provider is unavailable, or holds the real value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum EnrichmentField<T> {
    Pending,
    Placeholder,
    Value(T),
}

impl<T> EnrichmentField<T> {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, EnrichmentField::Placeholder)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, EnrichmentField::Value(_))
    }

    /// Borrow the real value, if computed.
    pub fn value(&self) -> Option<&T> {
        match self {
            EnrichmentField::Value(v) => Some(v),
            _ => None,
        }
    }
}

impl<T> Default for EnrichmentField<T> {
    fn default() -> Self {
        EnrichmentField::Pending
    }
}

/// Enrichment status of a catalog item.
///
/// Never stored independently of the fields in memory; see
/// [`Enrichment::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Placeholder,
    Complete,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Placeholder => "placeholder",
            EnrichmentStatus::Complete => "complete",
            EnrichmentStatus::Failed => "failed",
        }
    }

    /// Whether the pipeline has finished with the item (possibly degraded).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EnrichmentStatus::Pending)
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "placeholder" => Ok(EnrichmentStatus::Placeholder),
            "complete" => Ok(EnrichmentStatus::Complete),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown enrichment status: {}",
                other
            ))),
        }
    }
}

/// LLM-derived enrichment of a catalog item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrichment {
    pub summary: EnrichmentField<String>,
    pub key_contributions: EnrichmentField<Vec<String>>,
    pub keywords: EnrichmentField<BTreeSet<String>>,
    /// Reason for a permanent analysis failure. Set only for `Failed` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Enrichment {
    /// Every field parked behind the placeholder.
    pub fn all_placeholder() -> Self {
        Self {
            summary: EnrichmentField::Placeholder,
            key_contributions: EnrichmentField::Placeholder,
            keywords: EnrichmentField::Placeholder,
            failure: None,
        }
    }

    /// Fields left empty with the failure recorded.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Fully populated enrichment from analysis output.
    pub fn from_fields(fields: AnalysisFields) -> Self {
        Self {
            summary: EnrichmentField::Value(fields.summary),
            key_contributions: EnrichmentField::Value(fields.key_contributions),
            keywords: EnrichmentField::Value(fields.keywords),
            failure: None,
        }
    }

    /// Derive the item status from the field states.
    pub fn status(&self) -> EnrichmentStatus {
        if self.failure.is_some() {
            return EnrichmentStatus::Failed;
        }
        if self.summary.is_placeholder()
            || self.key_contributions.is_placeholder()
            || self.keywords.is_placeholder()
        {
            return EnrichmentStatus::Placeholder;
        }
        if self.summary.is_value() && self.key_contributions.is_value() && self.keywords.is_value()
        {
            return EnrichmentStatus::Complete;
        }
        EnrichmentStatus::Pending
    }
}

/// Output of a successful analysis call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisFields {
    pub summary: String,
    pub key_contributions: Vec<String>,
    pub keywords: BTreeSet<String>,
}

/// Input to the analysis gateway.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub item_id: String,
    pub title: String,
    /// Full text, or the abstract when extraction failed.
    pub text: String,
}

impl AnalysisRequest {
    /// Build the request from an item's stored fields, preferring full text.
    pub fn for_item(item: &CatalogItem, max_chars: usize) -> Self {
        let text = item
            .raw_content
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(item.metadata.abstract_text.as_deref())
            .unwrap_or_default();
        Self {
            item_id: item.id.clone(),
            title: item.metadata.title.clone(),
            text: truncate_chars(text, max_chars).to_string(),
        }
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// =============================================================================
// CATALOG ITEM
// =============================================================================

/// Reference to an item as returned by a source query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceItemRef {
    pub id: String,
    pub published_at: DateTime<Utc>,
}

/// Bibliographic metadata from the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub title: String,
    /// Ordered as listed by the source.
    pub authors: Vec<String>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    pub published_at: DateTime<Utc>,
    pub external_url: String,
}

/// Which embedding provider produced a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    Primary,
    Fallback,
}

impl EmbeddingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProvider::Primary => "primary",
            EmbeddingProvider::Fallback => "fallback",
        }
    }
}

impl fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary" => Ok(EmbeddingProvider::Primary),
            "fallback" => Ok(EmbeddingProvider::Fallback),
            other => Err(Error::InvalidInput(format!(
                "unknown embedding provider: {}",
                other
            ))),
        }
    }
}

/// An item embedding tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEmbedding {
    pub vector: Vec<f32>,
    pub provider: EmbeddingProvider,
    pub model: String,
}

impl ItemEmbedding {
    /// Whether two embeddings live in the same vector space.
    pub fn comparable_with(&self, other: &ItemEmbedding) -> bool {
        self.provider == other.provider
            && self.model == other.model
            && self.vector.len() == other.vector.len()
    }
}

/// Reading state set by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    #[default]
    Unread,
    Reading,
    Read,
}

impl ReadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unread => "unread",
            ReadStatus::Reading => "reading",
            ReadStatus::Read => "read",
        }
    }
}

impl FromStr for ReadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unread" => Ok(ReadStatus::Unread),
            "reading" => Ok(ReadStatus::Reading),
            "read" => Ok(ReadStatus::Read),
            other => Err(Error::InvalidInput(format!("unknown read status: {}", other))),
        }
    }
}

/// User-owned fields. Written only through
/// [`CatalogRepository::set_annotations`](crate::traits::CatalogRepository::set_annotations).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAnnotations {
    pub starred: bool,
    pub read_status: ReadStatus,
    pub user_notes: String,
}

/// A research item in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub metadata: SourceMetadata,
    /// `None` when extraction failed; distinct from an empty document.
    pub raw_content: Option<String>,
    pub embedding: Option<ItemEmbedding>,
    pub enrichment: Enrichment,
    pub annotations: ManualAnnotations,
    /// Whether the single manual re-trigger of a failed item was used.
    pub manual_retry_used: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogItem {
    /// A freshly fetched item with nothing enriched yet.
    pub fn new(id: impl Into<String>, metadata: SourceMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            metadata,
            raw_content: None,
            embedding: None,
            enrichment: Enrichment::default(),
            annotations: ManualAnnotations::default(),
            manual_retry_used: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> EnrichmentStatus {
        self.enrichment.status()
    }

    /// Text fed to the embedding providers.
    pub fn embedding_text(&self, content_chars: usize) -> String {
        let mut parts = vec![self.metadata.title.as_str()];
        if let Some(abs) = self.metadata.abstract_text.as_deref() {
            parts.push(abs);
        }
        if let Some(content) = self.raw_content.as_deref() {
            parts.push(truncate_chars(content, content_chars));
        }
        parts
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Predicate for catalog scans.
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub status: Option<EnrichmentStatus>,
    pub limit: Option<usize>,
}

impl ItemFilter {
    pub fn with_status(status: EnrichmentStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of a status-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// Another writer changed the status first; carries the stored status.
    StatusChanged(EnrichmentStatus),
    NotFound,
}

// =============================================================================
// IMPORT TASK
// =============================================================================

/// Opaque matching criteria passed to the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_query: Option<String>,
}

/// Result ordering requested from a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Newest first, ties broken by id ascending.
    #[default]
    NewestFirst,
}

/// Sort refs newest first with ties broken by id ascending.
pub fn sort_newest_first(refs: &mut [SourceItemRef]) {
    refs.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Stopped,
    Running,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Stopped => "stopped",
            TaskStatus::Running => "running",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(TaskStatus::Stopped),
            "running" => Ok(TaskStatus::Running),
            other => Err(Error::InvalidInput(format!("unknown task status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry of an import task's log tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl TaskLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self::at(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::at(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::at(LogLevel::Error, message)
    }

    fn at(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// A recurring import configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportTask {
    pub id: Uuid,
    pub name: String,
    pub filter: ImportFilter,
    pub interval_secs: u64,
    pub status: TaskStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub imported_total: u64,
    pub attempted_total: u64,
    pub log_tail: VecDeque<TaskLogEntry>,
    pub created_at: DateTime<Utc>,
}

impl ImportTask {
    /// Create a stopped task. Fails if the interval is below the minimum.
    pub fn new(name: impl Into<String>, filter: ImportFilter, interval_secs: u64) -> Result<Self> {
        validate_interval(interval_secs)?;
        Ok(Self {
            id: Uuid::now_v7(),
            name: name.into(),
            filter,
            interval_secs,
            status: TaskStatus::Stopped,
            last_run_at: None,
            imported_total: 0,
            attempted_total: 0,
            log_tail: VecDeque::new(),
            created_at: Utc::now(),
        })
    }

    pub fn running(mut self) -> Self {
        self.status = TaskStatus::Running;
        self
    }

    /// Append to the log tail, evicting the oldest entry when full.
    pub fn push_log(&mut self, entry: TaskLogEntry) {
        push_bounded(&mut self.log_tail, entry, defaults::TASK_LOG_TAIL);
    }
}

/// Reject intervals below [`defaults::IMPORT_MIN_INTERVAL_SECS`].
pub fn validate_interval(interval_secs: u64) -> Result<()> {
    if interval_secs < defaults::IMPORT_MIN_INTERVAL_SECS {
        return Err(Error::InvalidInput(format!(
            "interval must be at least {}s, got {}s",
            defaults::IMPORT_MIN_INTERVAL_SECS,
            interval_secs
        )));
    }
    Ok(())
}

pub(crate) fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

// =============================================================================
// RELATIONSHIP GRAPH
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    SharedAuthor,
    TopicSimilarity,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::SharedAuthor => "shared_author",
            EdgeKind::TopicSimilarity => "topic_similarity",
        }
    }
}

impl FromStr for EdgeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared_author" => Ok(EdgeKind::SharedAuthor),
            "topic_similarity" => Ok(EdgeKind::TopicSimilarity),
            other => Err(Error::InvalidInput(format!("unknown edge kind: {}", other))),
        }
    }
}

/// Undirected, weighted edge between two catalog items.
///
/// Endpoints are stored in byte order (`item_a < item_b`) so an unordered pair has
/// exactly one representation per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub item_a: String,
    pub item_b: String,
    pub kind: EdgeKind,
    pub weight: f32,
}

impl RelationshipEdge {
    pub fn new(a: impl Into<String>, b: impl Into<String>, kind: EdgeKind, weight: f32) -> Self {
        let (a, b) = (a.into(), b.into());
        let (item_a, item_b) = if a <= b { (a, b) } else { (b, a) };
        let weight = if weight.is_nan() {
            0.0
        } else {
            weight.clamp(0.0, 1.0)
        };
        Self {
            item_a,
            item_b,
            kind,
            weight,
        }
    }

    pub fn touches(&self, id: &str) -> bool {
        self.item_a == id || self.item_b == id
    }

    /// The endpoint that is not `id`.
    pub fn other(&self, id: &str) -> &str {
        if self.item_a == id {
            &self.item_b
        } else {
            &self.item_a
        }
    }
}

/// An item reached by a neighbourhood query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedItem {
    pub item_id: String,
    pub kind: EdgeKind,
    pub weight: f32,
    pub depth: usize,
}

// =============================================================================
// PROGRESS
// =============================================================================

/// What a progress event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ProgressSubject {
    Task(Uuid),
    Item(String),
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    TaskStarted,
    TaskStopped,
    CycleStarted,
    CycleFinished,
    CycleFailed,
    CycleSkipped,
    Fetch,
    Extract,
    Embed,
    Analyze,
    Persist,
    Complete,
    Placeholder,
    Failed,
    Duplicate,
    Backfilled,
}

impl ProgressStage {
    /// Default completion percentage reported for a stage.
    pub fn percent(&self) -> u8 {
        match self {
            ProgressStage::Fetch => 10,
            ProgressStage::Extract => 30,
            ProgressStage::Embed => 50,
            ProgressStage::Analyze => 70,
            ProgressStage::Persist => 90,
            ProgressStage::TaskStarted | ProgressStage::CycleStarted => 0,
            _ => 100,
        }
    }
}

/// Ephemeral progress notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub subject: ProgressSubject,
    pub stage: ProgressStage,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(subject: ProgressSubject, stage: ProgressStage) -> Self {
        Self {
            subject,
            stage,
            percent: stage.percent(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn item(id: impl Into<String>, stage: ProgressStage) -> Self {
        Self::new(ProgressSubject::Item(id.into()), stage)
    }

    pub fn task(id: Uuid, stage: ProgressStage) -> Self {
        Self::new(ProgressSubject::Task(id), stage)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = percent.min(100);
        self
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Read-only health snapshot for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub embedding_primary_available: bool,
    pub llm_available: bool,
    pub backfill_queue_size: u64,
}
