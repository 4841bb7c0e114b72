//! Relationship graph maintenance and neighbourhood queries.
//!
//! Edges are recomputed for an item when it becomes complete: one pass over
//! every other complete item. That linear scan is fine for catalogs in the
//! thousands; larger catalogs need a vector index, which is not built yet.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace};

use papertrail_core::{
    cosine_similarity, defaults, jaccard, CatalogItem, CatalogRepository, EdgeKind,
    EdgeRepository, EnrichmentStatus, ItemFilter, RelatedItem, RelationshipEdge, Result,
};

use crate::{env_u64, store_call};

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Cosine similarity an embedding pair must exceed to be linked.
    pub similarity_threshold: f32,
    /// Deadline for each catalog scan and edge write.
    pub store_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: defaults::TOPIC_SIMILARITY_THRESHOLD,
            store_timeout: Duration::from_secs(defaults::STORE_TIMEOUT_SECS),
        }
    }
}

impl GraphConfig {
    /// Reads `PAPERTRAIL_SIMILARITY_THRESHOLD` (a float in `[0, 1]`) and
    /// `PAPERTRAIL_STORE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let threshold = std::env::var("PAPERTRAIL_SIMILARITY_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|t| (0.0..=1.0).contains(t))
            .unwrap_or(d.similarity_threshold);
        Self {
            similarity_threshold: threshold,
            store_timeout: env_u64("PAPERTRAIL_STORE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.store_timeout),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }
}

pub struct GraphUpdater {
    catalog: Arc<dyn CatalogRepository>,
    edges: Arc<dyn EdgeRepository>,
    config: GraphConfig,
}

impl GraphUpdater {
    pub fn new(
        catalog: Arc<dyn CatalogRepository>,
        edges: Arc<dyn EdgeRepository>,
        config: GraphConfig,
    ) -> Self {
        Self {
            catalog,
            edges,
            config,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Link a newly complete item to every other complete item.
    ///
    /// Returns the number of edges written. Items that are not complete are
    /// ignored so placeholders never enter the graph.
    #[instrument(skip(self, item), fields(subsystem = "graph", op = "on_item_complete", item_id = %item.id))]
    pub async fn on_item_complete(&self, item: &CatalogItem) -> Result<usize> {
        if item.status() != EnrichmentStatus::Complete {
            debug!(status = %item.status(), "Skipping graph update for incomplete item");
            return Ok(0);
        }

        let start = Instant::now();
        let others = store_call(
            "catalog scan",
            self.config.store_timeout,
            self.catalog
                .scan(ItemFilter::with_status(EnrichmentStatus::Complete)),
        )
        .await?;

        let mut written = 0usize;
        for other in others.iter().filter(|o| o.id != item.id) {
            for edge in self.edges_between(item, other) {
                trace!(other = %other.id, kind = edge.kind.as_str(), weight = edge.weight, "Upserting edge");
                store_call("edge upsert", self.config.store_timeout, self.edges.upsert(&edge))
                    .await?;
                written += 1;
            }
        }

        info!(
            edge_count = written,
            compared = others.len().saturating_sub(1),
            duration_ms = start.elapsed().as_millis() as u64,
            "Graph updated"
        );
        Ok(written)
    }

    /// Edges that should exist between two complete items.
    pub fn edges_between(&self, a: &CatalogItem, b: &CatalogItem) -> Vec<RelationshipEdge> {
        let mut out = Vec::new();

        let shared = jaccard(&a.metadata.authors, &b.metadata.authors);
        if shared > 0.0 {
            out.push(RelationshipEdge::new(
                a.id.clone(),
                b.id.clone(),
                EdgeKind::SharedAuthor,
                shared,
            ));
        }

        if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
            // Vectors from different providers live in different spaces.
            if ea.comparable_with(eb) {
                let sim = cosine_similarity(&ea.vector, &eb.vector);
                if sim > self.config.similarity_threshold {
                    out.push(RelationshipEdge::new(
                        a.id.clone(),
                        b.id.clone(),
                        EdgeKind::TopicSimilarity,
                        sim,
                    ));
                }
            }
        }

        out
    }

    /// All edges touching an item.
    pub async fn edges_for(&self, item_id: &str) -> Result<Vec<RelationshipEdge>> {
        store_call("edges_for", self.config.store_timeout, self.edges.edges_for(item_id)).await
    }

    /// Breadth-first neighbourhood of an item up to `max_depth` hops.
    ///
    /// Each neighbour is reported once, at its shallowest depth and through
    /// its strongest edge. Results are ordered by depth, then weight
    /// descending, and truncated to `limit`.
    #[instrument(skip(self), fields(subsystem = "graph", op = "related"))]
    pub async fn related(
        &self,
        item_id: &str,
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<RelatedItem>> {
        let mut visited: HashSet<String> = HashSet::from([item_id.to_string()]);
        let mut frontier: VecDeque<String> = VecDeque::from([item_id.to_string()]);
        let mut found = Vec::new();

        for depth in 1..=max_depth {
            let mut next = VecDeque::new();
            while let Some(node) = frontier.pop_front() {
                let mut edges = self.edges_for(&node).await?;
                edges.sort_by(|a, b| b.weight.total_cmp(&a.weight));
                for edge in edges {
                    let other = edge.other(&node).to_string();
                    if visited.insert(other.clone()) {
                        found.push(RelatedItem {
                            item_id: other.clone(),
                            kind: edge.kind,
                            weight: edge.weight,
                            depth,
                        });
                        next.push_back(other);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        found.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| b.weight.total_cmp(&a.weight))
        });
        found.truncate(limit);
        Ok(found)
    }
}
