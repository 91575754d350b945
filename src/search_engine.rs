use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::embeddings::Embedder;
use crate::paper_store::PaperStore;
use crate::vector_store::{IndexHit, VectorIndex};

/// Errors surfaced by the query path. Every collaborator failure aborts the
/// whole query; there is no partial-success merge.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("encoding failed for model '{model}': {reason}")]
    Encoding { model: String, reason: String },

    #[error("vector index unavailable for collection '{collection}': {reason}")]
    IndexUnavailable { collection: String, reason: String },
}

impl SearchError {
    /// Stable kind tag carried in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::InvalidQuery { .. } => "invalid_query",
            SearchError::Encoding { .. } => "encoding_error",
            SearchError::IndexUnavailable { .. } => "index_unavailable",
        }
    }
}

/// Which model's collection produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLabel {
    /// Fine-tuned model collection. Wins ties and overlaps.
    Custom,
    /// Baseline model collection.
    Base,
}

/// A labeled hit after cross-collection dedup, before metadata attach.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub paper_id: String,
    pub score: f32,
    pub source: SourceLabel,
}

/// Final presentation record for one matched paper.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub score: f32,
    pub source: SourceLabel,
}

/// Collection names and per-call timeouts for the query path.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub custom_collection: String,
    pub base_collection: String,
    pub encode_timeout: Duration,
    pub search_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            custom_collection: "research_papers_custom".to_string(),
            base_collection: "research_papers".to_string(),
            encode_timeout: Duration::from_secs(30),
            search_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinates one query across both model collections and merges the hits.
///
/// The engine is a read-only handle: it never writes to the paper store or
/// the vector index, so it is shared across concurrent requests as a plain
/// `Arc` without locking.
pub struct SearchEngine {
    paper_store: Arc<PaperStore>,
    index: Arc<dyn VectorIndex>,
    custom_encoder: Arc<dyn Embedder>,
    base_encoder: Arc<dyn Embedder>,
    settings: EngineSettings,
}

impl SearchEngine {
    pub fn new(
        paper_store: Arc<PaperStore>,
        index: Arc<dyn VectorIndex>,
        custom_encoder: Arc<dyn Embedder>,
        base_encoder: Arc<dyn Embedder>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            paper_store,
            index,
            custom_encoder,
            base_encoder,
            settings,
        }
    }

    /// Searches both collections and returns a single ranked, labeled,
    /// deduplicated result list, at most `2 * top_k` entries.
    ///
    /// Fewer than `top_k` hits per collection is a normal short result, not
    /// an error.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, SearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(SearchError::InvalidQuery {
                reason: "query must be non-empty".to_string(),
            });
        }

        let top_k = top_k.max(1);
        tracing::debug!("Searching for: '{}'", query);

        // The two encodings have no data dependency; run them concurrently.
        let (custom_vector, base_vector) = tokio::join!(
            self.encode(&self.custom_encoder, query),
            self.encode(&self.base_encoder, query),
        );
        let custom_vector = custom_vector?;
        let base_vector = base_vector?;

        // The custom search must complete first: its ids are excluded from
        // the base search.
        let custom_hits = self
            .search_collection(&self.settings.custom_collection, &custom_vector, top_k, None)
            .await?;

        let seen_ids: HashSet<String> = custom_hits.iter().map(|hit| hit.id.clone()).collect();

        let base_hits = self
            .search_collection(
                &self.settings.base_collection,
                &base_vector,
                top_k,
                Some(&seen_ids),
            )
            .await?;

        let merged = merge_hits(custom_hits, base_hits);
        if merged.len() < top_k {
            tracing::debug!(
                "Only {} of {} requested results available after dedup",
                merged.len(),
                top_k
            );
        }

        Ok(merged.into_iter().map(|hit| self.present(hit)).collect())
    }

    pub fn paper_store(&self) -> &PaperStore {
        &self.paper_store
    }

    async fn encode(
        &self,
        encoder: &Arc<dyn Embedder>,
        query: &str,
    ) -> Result<Vec<f32>, SearchError> {
        let model = encoder.model_name().to_string();
        match tokio::time::timeout(self.settings.encode_timeout, encoder.encode(query)).await {
            Ok(Ok(vector)) => Ok(vector),
            Ok(Err(e)) => Err(SearchError::Encoding {
                model,
                reason: e.to_string(),
            }),
            Err(_) => Err(SearchError::Encoding {
                model,
                reason: format!(
                    "encode timed out after {}s",
                    self.settings.encode_timeout.as_secs()
                ),
            }),
        }
    }

    async fn search_collection(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        exclude: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>, SearchError> {
        match tokio::time::timeout(
            self.settings.search_timeout,
            self.index.search(collection, vector, k, exclude),
        )
        .await
        {
            Ok(Ok(hits)) => Ok(hits),
            Ok(Err(e)) => Err(SearchError::IndexUnavailable {
                collection: collection.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(SearchError::IndexUnavailable {
                collection: collection.to_string(),
                reason: format!(
                    "search timed out after {}s",
                    self.settings.search_timeout.as_secs()
                ),
            }),
        }
    }

    fn present(&self, hit: ScoredHit) -> SearchHit {
        match self.paper_store.get(&hit.paper_id) {
            Some(paper) => SearchHit {
                id: hit.paper_id,
                title: paper.title.clone(),
                snippet: paper.snippet(),
                authors: paper.authors.clone(),
                link: paper.link.clone(),
                score: hit.score,
                source: hit.source,
            },
            None => {
                tracing::warn!(
                    "Paper {} has a vector but no corpus metadata",
                    hit.paper_id
                );
                SearchHit {
                    id: hit.paper_id,
                    title: "N/A".to_string(),
                    snippet: String::new(),
                    authors: None,
                    link: None,
                    score: hit.score,
                    source: hit.source,
                }
            }
        }
    }
}

/// Merges custom and base hits into one list sorted by descending score.
///
/// Custom hits enter the list first, so the stable sort keeps them ahead of
/// base hits with equal scores and preserves each collection's own rank
/// order among ties. A paper returned by both collections keeps the custom
/// hit and its score; the base duplicate is dropped even when it scored
/// higher.
fn merge_hits(custom: Vec<IndexHit>, base: Vec<IndexHit>) -> Vec<ScoredHit> {
    let mut merged: Vec<ScoredHit> = Vec::with_capacity(custom.len() + base.len());
    let mut seen: HashSet<String> = HashSet::new();

    let labeled = custom
        .into_iter()
        .map(|hit| (hit, SourceLabel::Custom))
        .chain(base.into_iter().map(|hit| (hit, SourceLabel::Base)));

    for (hit, source) in labeled {
        if seen.insert(hit.id.clone()) {
            merged.push(ScoredHit {
                paper_id: hit.id,
                score: hit.score,
                source,
            });
        }
    }

    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    merged
}
