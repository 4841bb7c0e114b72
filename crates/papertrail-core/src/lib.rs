//! # papertrail-core
//!
//! Core types, traits, and shared primitives for the PaperTrail ingestion core.
//!
//! This crate provides the data model (catalog items, import tasks,
//! relationship edges, progress events), the repository and provider traits
//! that the storage and inference crates implement, and the two pieces of
//! shared mutable state every worker touches: the [`CircuitBreaker`] and the
//! [`ProgressBroadcaster`].
//!
//! ## Logging
//!
//! Every crate logs through `tracing` with the structured fields
//! `subsystem`, `component`, `op`, `task_id`, `item_id` and `duration_ms`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), cycle completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data |

pub mod breaker;
pub mod defaults;
pub mod error;
pub mod events;
pub mod memory;
pub mod models;
pub mod similarity;
pub mod traits;

// Re-export commonly used types at crate root
pub use breaker::{Admission, BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use error::{AnalysisError, Error, Result};
pub use events::{ProgressBroadcaster, Subscription};
pub use memory::{InMemoryCatalog, InMemoryEdges, InMemoryTasks};
pub use models::*;
pub use similarity::{cosine_similarity, jaccard};
pub use traits::*;
