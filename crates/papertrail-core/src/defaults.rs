//! Centralized default values shared across the PaperTrail crates.
//!
//! Every config struct's `Default` impl reads from here so that the numbers
//! live in one place. Environment overrides are applied by each struct's
//! `from_env()`.

// =============================================================================
// IMPORT SCHEDULER
// =============================================================================

/// Smallest allowed polling interval for an import task (seconds).
pub const IMPORT_MIN_INTERVAL_SECS: u64 = 30;

/// Default polling interval for a new import task (seconds).
pub const IMPORT_INTERVAL_SECS: u64 = 60;

/// Number of entries kept in an import task's log tail.
pub const TASK_LOG_TAIL: usize = 100;

/// Timeout for a single source query (seconds).
pub const SOURCE_QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum wait for in-flight loops during shutdown (seconds).
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

// =============================================================================
// ENRICHMENT PIPELINE
// =============================================================================

/// Timeout for fetching item metadata (seconds).
pub const FETCH_TIMEOUT_SECS: u64 = 30;

/// Timeout for fetching item full text (seconds).
pub const EXTRACT_TIMEOUT_SECS: u64 = 60;

/// Timeout for a single record store operation (seconds).
pub const STORE_TIMEOUT_SECS: u64 = 10;

/// Characters of full text appended to the embedding input.
pub const EMBED_TEXT_CHARS: usize = 4_000;

/// Characters of full text sent to the analysis model.
pub const ANALYSIS_TEXT_CHARS: usize = 8_000;

// =============================================================================
// AI GATEWAYS
// =============================================================================

/// Ollama endpoint.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Primary embedding model.
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Primary embedding dimension.
pub const EMBED_DIMENSION: usize = 768;

/// Analysis (generation) model.
pub const GEN_MODEL: &str = "qwen3:8b";

/// Timeout for primary embedding requests (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;

/// Timeout for analysis requests (seconds).
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Dimension of the local hashing fallback embedder.
pub const FALLBACK_EMBED_DIMENSION: usize = 384;

/// Consecutive failures before a breaker opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;

/// Sliding window over which consecutive failures are counted (seconds).
pub const BREAKER_WINDOW_SECS: u64 = 60;

/// Initial open-state cooldown (seconds).
pub const BREAKER_COOLDOWN_SECS: u64 = 30;

/// Upper bound for the doubled cooldown (seconds).
pub const BREAKER_MAX_COOLDOWN_SECS: u64 = 600;

// =============================================================================
// BACKFILL WORKER
// =============================================================================

/// Interval between backfill cycles (seconds).
pub const BACKFILL_INTERVAL_SECS: u64 = 60;

/// Maximum placeholder items processed per backfill cycle.
pub const BACKFILL_BATCH: usize = 50;

// =============================================================================
// RELATIONSHIP GRAPH
// =============================================================================

/// Cosine similarity an embedding pair must exceed to become a
/// TopicSimilarity edge.
pub const TOPIC_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Default traversal depth for neighbourhood queries.
pub const RELATED_MAX_DEPTH: usize = 2;

/// Default result limit for neighbourhood queries.
pub const RELATED_LIMIT: usize = 20;

// =============================================================================
// PROGRESS BROADCAST
// =============================================================================

/// Per-subscriber buffer of the progress broadcaster.
pub const PROGRESS_BUFFER: usize = 256;
