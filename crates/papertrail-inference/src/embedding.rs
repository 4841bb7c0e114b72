//! Embedding gateway: primary provider with a local fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use papertrail_core::{
    defaults, BreakerConfig, BreakerError, CircuitBreaker, EmbeddingBackend, EmbeddingProvider,
    Error, ItemEmbedding, Result,
};

/// A vector plus the provider that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    pub provider: EmbeddingProvider,
    pub model: String,
}

impl From<EmbeddingOutput> for ItemEmbedding {
    fn from(out: EmbeddingOutput) -> Self {
        ItemEmbedding {
            vector: out.vector,
            provider: out.provider,
            model: out.model,
        }
    }
}

/// Routes embedding calls to the primary provider while its breaker allows,
/// otherwise straight to the fallback.
pub struct EmbeddingGateway {
    primary: Arc<dyn EmbeddingBackend>,
    fallback: Arc<dyn EmbeddingBackend>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(
        primary: Arc<dyn EmbeddingBackend>,
        fallback: Arc<dyn EmbeddingBackend>,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker: Arc::new(CircuitBreaker::new("embedding_primary", breaker)),
            timeout: Duration::from_secs(defaults::EMBED_TIMEOUT_SECS),
        }
    }

    /// Deadline applied to each provider call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the primary provider is currently trusted.
    pub fn is_primary_available(&self) -> bool {
        self.breaker.is_available()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Embed `text`, preferring the primary provider.
    ///
    /// Fails only when both providers fail.
    #[instrument(skip(self, text), fields(subsystem = "inference", component = "embedding_gateway", op = "embed", text_len = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<EmbeddingOutput> {
        let start = Instant::now();

        let primary_err = match self
            .breaker
            .call(embed_single(self.primary.as_ref(), text, self.timeout))
            .await
        {
            Ok(vector) => {
                debug!(
                    provider = "primary",
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Embedded with primary provider"
                );
                return Ok(EmbeddingOutput {
                    vector,
                    provider: EmbeddingProvider::Primary,
                    model: self.primary.model_name().to_string(),
                });
            }
            Err(BreakerError::Open) => {
                debug!("Primary embedder suspected down, using fallback");
                "circuit open".to_string()
            }
            Err(BreakerError::Inner(e)) => {
                warn!(error = %e, "Primary embedder failed, using fallback");
                e.to_string()
            }
        };

        match embed_single(self.fallback.as_ref(), text, self.timeout).await {
            Ok(vector) => {
                debug!(
                    provider = "fallback",
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Embedded with fallback provider"
                );
                Ok(EmbeddingOutput {
                    vector,
                    provider: EmbeddingProvider::Fallback,
                    model: self.fallback.model_name().to_string(),
                })
            }
            Err(e) => Err(Error::Embedding(format!(
                "primary failed ({}); fallback failed ({})",
                primary_err, e
            ))),
        }
    }
}

async fn embed_single(
    backend: &dyn EmbeddingBackend,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let texts = [text.to_string()];
    let vectors = tokio::time::timeout(timeout, backend.embed_texts(&texts))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "{} embedding after {}s",
                backend.model_name(),
                timeout.as_secs()
            ))
        })??;
    match vectors.into_iter().next() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::Embedding(format!(
            "{} returned no vector",
            backend.model_name()
        ))),
    }
}
