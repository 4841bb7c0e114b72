//! # papertrail-inference
//!
//! AI provider access for the PaperTrail ingestion core.
//!
//! - [`OllamaBackend`]: HTTP backend for embeddings and generation.
//! - [`HashEmbedder`]: offline feature-hashing embedder used as the
//!   always-available embedding fallback.
//! - [`EmbeddingGateway`]: primary embedder guarded by a circuit breaker,
//!   falling back to the local embedder.
//! - [`AnalysisGateway`]: LLM analysis guarded by a circuit breaker, with
//!   no fallback provider.

pub mod analysis;
pub mod embedding;
pub mod hash_embed;
#[cfg(feature = "ollama")]
pub mod ollama;

pub use analysis::{parse_analysis, AnalysisConfig, AnalysisGateway};
pub use embedding::{EmbeddingGateway, EmbeddingOutput};
pub use hash_embed::HashEmbedder;
#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;
