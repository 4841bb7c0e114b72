//! Analysis gateway: LLM enrichment behind a circuit breaker.
//!
//! There is no fallback provider. Every provider-side problem (open breaker,
//! timeout, transport or HTTP error, output that is not the expected JSON)
//! surfaces as [`AnalysisError::Unavailable`]; a request without usable
//! text is [`AnalysisError::InvalidInput`] and never reaches the provider.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use papertrail_core::{
    defaults, truncate_chars, AnalysisError, AnalysisFields, AnalysisRequest, BreakerConfig,
    BreakerError, CircuitBreaker, Error, GenerationBackend, Result,
};

const SYSTEM_PROMPT: &str = "You are a research assistant that reads academic papers and \
produces concise structured analyses. Respond with a single JSON object and nothing else.";

/// Timeouts and input limits for analysis calls.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub timeout: Duration,
    pub max_text_chars: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(defaults::GEN_TIMEOUT_SECS),
            max_text_chars: defaults::ANALYSIS_TEXT_CHARS,
        }
    }
}

impl AnalysisConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct AnalysisGateway {
    backend: Arc<dyn GenerationBackend>,
    breaker: Arc<CircuitBreaker>,
    config: AnalysisConfig,
}

impl AnalysisGateway {
    pub fn new(
        backend: Arc<dyn GenerationBackend>,
        breaker: BreakerConfig,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            backend,
            breaker: Arc::new(CircuitBreaker::new("analysis", breaker)),
            config,
        }
    }

    /// Whether an analysis call made now would reach the provider.
    pub fn is_available(&self) -> bool {
        self.breaker.is_available()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Ask the provider directly whether it is up, bypassing the breaker.
    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await.unwrap_or(false)
    }

    #[instrument(skip(self, request), fields(subsystem = "inference", component = "analysis_gateway", op = "analyze", item_id = %request.item_id))]
    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
    ) -> std::result::Result<AnalysisFields, AnalysisError> {
        if request.text.trim().is_empty() {
            return Err(AnalysisError::InvalidInput(
                "no usable text to analyse".to_string(),
            ));
        }

        let start = Instant::now();
        let prompt = build_prompt(request, self.config.max_text_chars);
        let timeout = self.config.timeout;
        let backend = self.backend.as_ref();

        let call = async move {
            let raw = tokio::time::timeout(
                timeout,
                backend.generate_json_with_system(SYSTEM_PROMPT, &prompt),
            )
            .await
            .map_err(|_| Error::Timeout(format!("analysis after {}s", timeout.as_secs())))??;
            parse_analysis(&raw).map_err(Error::Inference)
        };

        match self.breaker.call(call).await {
            Ok(fields) => {
                debug!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    keyword_count = fields.keywords.len(),
                    "Analysis complete"
                );
                Ok(fields)
            }
            Err(BreakerError::Open) => Err(AnalysisError::Unavailable("circuit open".to_string())),
            Err(BreakerError::Inner(e)) => {
                warn!(error = %e, "Analysis provider call failed");
                Err(AnalysisError::Unavailable(e.to_string()))
            }
        }
    }
}

fn build_prompt(request: &AnalysisRequest, max_chars: usize) -> String {
    format!(
        "Analyse the following paper.\n\n\
         Title: {}\n\n\
         Text:\n{}\n\n\
         Return JSON with exactly these keys:\n\
         - \"summary\": a 3-5 sentence summary\n\
         - \"key_contributions\": list of the main contributions, one sentence each\n\
         - \"keywords\": list of 5-10 short topical keywords",
        request.title,
        truncate_chars(&request.text, max_chars)
    )
}

#[derive(Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    key_contributions: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Parse model output into analysis fields.
///
/// Tolerates `<think>` blocks, markdown code fences and prose around the
/// JSON object. A missing or blank summary is an error.
pub fn parse_analysis(raw: &str) -> std::result::Result<AnalysisFields, String> {
    let think = Regex::new(r"(?s)<think>.*?</think>").map_err(|e| e.to_string())?;
    let cleaned = think.replace_all(raw, "");

    let fence = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").map_err(|e| e.to_string())?;
    let body = fence
        .captures(&cleaned)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(&cleaned);

    let (start, end) = match (body.find('{'), body.rfind('}')) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return Err("no JSON object in model output".to_string()),
    };

    let parsed: RawAnalysis = serde_json::from_str(&body[start..=end])
        .map_err(|e| format!("malformed analysis JSON: {}", e))?;

    let summary = parsed.summary.trim().to_string();
    if summary.is_empty() {
        return Err("analysis has no summary".to_string());
    }

    let key_contributions = parsed
        .key_contributions
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let keywords: BTreeSet<String> = parsed
        .keywords
        .into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    Ok(AnalysisFields {
        summary,
        key_contributions,
        keywords,
    })
}
