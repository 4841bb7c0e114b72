//! JSON item source over HTTP.
//!
//! Endpoints, relative to the base URL:
//!
//! | Request | Response |
//! |---------|----------|
//! | `GET /items?category=&q=&semantic=&order=newest` | array of `{id, published_at}` |
//! | `GET /items/{id}` | item metadata |
//! | `GET /items/{id}/content` | extracted full text as `text/plain` |

use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, instrument};

use papertrail_core::{
    defaults, ContentSource, Error, ImportFilter, Result, SortOrder, SourceItemRef,
    SourceMetadata, SourceQuery,
};

pub struct HttpSource {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid source url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("source url {} cannot be a base", base_url)));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            timeout: Duration::from_secs(defaults::SOURCE_QUERY_TIMEOUT_SECS),
        })
    }

    /// Reads `PAPERTRAIL_SOURCE_URL`.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("PAPERTRAIL_SOURCE_URL")
            .map_err(|_| Error::Config("PAPERTRAIL_SOURCE_URL is not set".into()))?;
        Self::new(&url)
    }

    /// Per-request deadline. Callers usually apply a tighter one per stage.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("source url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::Source(format!("GET {}: {}", url.path(), e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Source(format!(
                "GET {} returned {}: {}",
                url.path(),
                status,
                body
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl SourceQuery for HttpSource {
    #[instrument(skip(self, filter), fields(subsystem = "source", op = "query"))]
    async fn query(&self, filter: &ImportFilter, order: SortOrder) -> Result<Vec<SourceItemRef>> {
        let mut url = self.url(&["items"])?;
        {
            let mut params = url.query_pairs_mut();
            if let Some(category) = &filter.category {
                params.append_pair("category", category);
            }
            if let Some(q) = &filter.text_query {
                params.append_pair("q", q);
            }
            if let Some(semantic) = &filter.semantic_query {
                params.append_pair("semantic", semantic);
            }
            match order {
                SortOrder::NewestFirst => params.append_pair("order", "newest"),
            };
        }

        let refs: Vec<SourceItemRef> = self
            .get(url)
            .await?
            .json()
            .await
            .map_err(|e| Error::Source(format!("invalid query response: {}", e)))?;
        debug!(result_count = refs.len(), "Source query complete");
        Ok(refs)
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    async fn fetch_metadata(&self, item: &SourceItemRef) -> Result<SourceMetadata> {
        let url = self.url(&["items", &item.id])?;
        self.get(url)
            .await?
            .json()
            .await
            .map_err(|e| Error::Source(format!("invalid metadata for {}: {}", item.id, e)))
    }

    async fn fetch_content(&self, item: &SourceItemRef) -> Result<String> {
        let url = self.url(&["items", &item.id, "content"])?;
        let text = self
            .get(url)
            .await?
            .text()
            .await
            .map_err(|e| Error::Source(format!("unreadable content for {}: {}", item.id, e)))?;
        if text.trim().is_empty() {
            return Err(Error::Source(format!("empty content for {}", item.id)));
        }
        Ok(text)
    }
}
