use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

const PERSISTED_VERSION: u32 = 1;

/// Similarity metric a collection was built with. Must match the metric the
/// embeddings were produced for; a mismatch degrades ranking quality rather
/// than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Inner product over vectors stored as-is.
    Ip,
    /// Cosine similarity; vectors are unit-normalized on upsert and load.
    Cosine,
}

/// One nearest-neighbor match: paper id plus similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub id: String,
    pub score: f32,
}

/// Nearest-neighbor search over named collections.
/// The search engine only depends on this trait, so tests substitute an
/// in-memory fake (or a hand-built `VectorStore`) for the file-backed store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-k matches in `collection`, sorted by descending similarity.
    /// Ids in `exclude` are filtered out before ranking, so the caller still
    /// receives up to `k` hits when the collection has enough candidates.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        exclude: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>>;
}

/// A single vector collection: at most one fixed-dimension vector per paper.
#[derive(Debug, Clone)]
pub struct VectorCollection {
    name: String,
    metric: Metric,
    dim: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl VectorCollection {
    /// Collections served by the query path are loaded from disk; the corpus
    /// build and tests construct them directly.
    #[allow(dead_code)]
    pub fn new(name: &str, metric: Metric, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            metric,
            dim,
            vectors: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Insert or replace the vector for a paper id. Write path for the
    /// corpus build; the query path only reads.
    #[allow(dead_code)]
    pub fn upsert(&mut self, id: &str, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(anyhow::anyhow!(
                "Vector dimension {} does not match collection '{}' dimension {}",
                vector.len(),
                self.name,
                self.dim
            ));
        }
        if self.metric == Metric::Cosine {
            normalize(&mut vector);
        }
        self.vectors.insert(id.to_string(), vector);
        Ok(())
    }

    /// Exact top-k scan. Equal scores are broken by paper id so repeated
    /// identical queries return identical ordered lists.
    pub fn top_k(
        &self,
        query: &[f32],
        k: usize,
        exclude: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>> {
        if query.len() != self.dim {
            return Err(anyhow::anyhow!(
                "Query vector dimension {} does not match collection '{}' dimension {}",
                query.len(),
                self.name,
                self.dim
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let normalized_query = match self.metric {
            Metric::Ip => None,
            Metric::Cosine => {
                let mut copy = query.to_vec();
                normalize(&mut copy);
                Some(copy)
            }
        };
        let query = normalized_query.as_deref().unwrap_or(query);

        let mut hits: Vec<IndexHit> = self
            .vectors
            .iter()
            .filter(|(id, _)| exclude.map_or(true, |set| !set.contains(id.as_str())))
            .map(|(id, vector)| IndexHit {
                id: id.clone(),
                score: dot_product(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Persist this collection atomically (temp file + rename).
    #[allow(dead_code)] // Write path for the corpus build
    pub async fn save(&self, data_dir: &str) -> Result<()> {
        #[derive(Serialize)]
        struct PersistedCollection<'a> {
            version: u32,
            name: &'a str,
            metric: Metric,
            dim: usize,
            vectors: &'a HashMap<String, Vec<f32>>,
        }

        let final_path = collection_path(data_dir, &self.name);
        let temp_path = final_path.with_extension("json.tmp");

        let state = PersistedCollection {
            version: PERSISTED_VERSION,
            name: &self.name,
            metric: self.metric,
            dim: self.dim,
            vectors: &self.vectors,
        };

        let data = serde_json::to_string(&state)?;

        tokio::fs::write(&temp_path, data)
            .await
            .context("Failed to write collection to temporary file")?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .context("Failed to commit collection file (atomic rename)")?;

        tracing::debug!(
            "Saved {} vectors to {:?} for collection '{}'",
            self.vectors.len(),
            final_path,
            self.name
        );
        Ok(())
    }

    async fn load(data_dir: &str, name: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct PersistedCollection {
            version: u32,
            name: String,
            metric: Metric,
            dim: usize,
            vectors: HashMap<String, Vec<f32>>,
        }

        let path = collection_path(data_dir, name);
        let data = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read collection file {path:?}"))?;

        let state: PersistedCollection = serde_json::from_str(&data)
            .with_context(|| format!("Corrupt collection file {path:?}"))?;

        if state.version > PERSISTED_VERSION {
            return Err(anyhow::anyhow!(
                "Collection file {path:?} has unsupported version {}",
                state.version
            ));
        }
        if state.name != name {
            tracing::warn!(
                "Collection file {:?} declares name '{}', expected '{}'",
                path,
                state.name,
                name
            );
        }

        let mut collection = Self {
            name: name.to_string(),
            metric: state.metric,
            dim: state.dim,
            vectors: state.vectors,
        };

        // Re-normalize on load so cosine collections written by older tooling
        // still satisfy the unit-length assumption.
        if collection.metric == Metric::Cosine {
            for vector in collection.vectors.values_mut() {
                normalize(vector);
            }
        }

        tracing::info!(
            "Loaded {} vectors from {:?} (metric {:?}, dim {})",
            collection.vectors.len(),
            path,
            collection.metric,
            collection.dim
        );
        Ok(collection)
    }
}

/// File-backed store of named vector collections. Collections are written by
/// the offline corpus build; the query path only reads.
pub struct VectorStore {
    collections: HashMap<String, VectorCollection>,
}

impl VectorStore {
    /// Load the named collections from `data_dir`. A missing collection file
    /// is tolerated (searches against it fail until the corpus build runs);
    /// a corrupt one is a hard error.
    pub async fn open(data_dir: &str, names: &[&str]) -> Result<Self> {
        let mut collections = HashMap::new();

        for name in names {
            let path = collection_path(data_dir, name);
            if !tokio::fs::try_exists(&path).await? {
                tracing::warn!(
                    "Collection file {:?} not found. Searches against '{}' will fail until the corpus build populates it.",
                    path,
                    name
                );
                continue;
            }
            let collection = VectorCollection::load(data_dir, name).await?;
            collections.insert(name.to_string(), collection);
        }

        Ok(Self { collections })
    }

    /// Build a store from already-populated collections. Used by tests and
    /// by the corpus-build tooling before saving.
    #[allow(dead_code)]
    pub fn from_collections(collections: Vec<VectorCollection>) -> Self {
        Self {
            collections: collections
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let collections: Vec<serde_json::Value> = {
            let mut names: Vec<&String> = self.collections.keys().collect();
            names.sort();
            names
                .into_iter()
                .map(|name| {
                    let c = &self.collections[name];
                    serde_json::json!({
                        "name": c.name(),
                        "vectors": c.len(),
                        "dim": c.dim(),
                        "metric": c.metric(),
                    })
                })
                .collect()
        };
        serde_json::json!({ "collections": collections })
    }
}

#[async_trait]
impl VectorIndex for VectorStore {
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        exclude: Option<&HashSet<String>>,
    ) -> Result<Vec<IndexHit>> {
        let collection = self
            .collections
            .get(collection)
            .ok_or_else(|| anyhow::anyhow!("Collection '{collection}' is not loaded"))?;
        collection.top_k(vector, k, exclude)
    }
}

/// Sanitizes a collection name for safe use as a filename.
fn sanitize_collection_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }

    let sanitized: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_' || c == '.') {
        "default".to_string()
    } else {
        sanitized
    }
}

/// File path for a collection within the data directory.
pub fn collection_path(data_dir: &str, name: &str) -> PathBuf {
    PathBuf::from(data_dir).join(format!("collection_{}.json", sanitize_collection_name(name)))
}

/// Normalize a vector to unit length in-place.
/// If the vector has zero or very small norm, it is left unchanged.
fn normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 1e-20 {
        let norm = norm_sq.sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Dot product between two vectors of the same length.
/// For unit-normalized vectors this equals cosine similarity.
#[inline(always)]
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basis_vector(dim: usize, axis: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = scale;
        v
    }

    #[test]
    fn test_upsert_rejects_dimension_mismatch() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 4);
        let result = collection.upsert("p1", vec![1.0, 0.0]);
        assert!(result.is_err());
        assert!(collection.is_empty());
    }

    #[test]
    fn test_upsert_replaces_existing_vector() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 2);
        collection.upsert("p1", vec![1.0, 0.0]).unwrap();
        collection.upsert("p1", vec![0.0, 1.0]).unwrap();

        assert_eq!(collection.len(), 1, "At most one vector per paper id");

        let hits = collection.top_k(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].id, "p1");
        assert!(hits[0].score > 0.9);
    }

    #[test]
    fn test_top_k_orders_by_descending_score() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 3);
        collection.upsert("far", basis_vector(3, 1, 1.0)).unwrap();
        collection.upsert("near", basis_vector(3, 0, 1.0)).unwrap();
        collection
            .upsert("close", vec![0.8, 0.6, 0.0])
            .unwrap();

        let hits = collection.top_k(&basis_vector(3, 0, 1.0), 3, None).unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "close", "far"]);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[test]
    fn test_top_k_truncates_to_k() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 2);
        for i in 0..10 {
            collection
                .upsert(&format!("p{i}"), vec![1.0, i as f32 * 0.01])
                .unwrap();
        }

        let hits = collection.top_k(&[1.0, 0.0], 3, None).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_top_k_excludes_ids_and_backfills() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 2);
        collection.upsert("a", vec![1.0, 0.0]).unwrap();
        collection.upsert("b", vec![0.9, 0.0]).unwrap();
        collection.upsert("c", vec![0.8, 0.0]).unwrap();

        let exclude: HashSet<String> = ["a".to_string()].into_iter().collect();
        let hits = collection.top_k(&[1.0, 0.0], 2, Some(&exclude)).unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["b", "c"],
            "Excluded id is filtered before ranking, so k is still reached"
        );
    }

    #[test]
    fn test_equal_scores_tie_break_by_id() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 2);
        collection.upsert("zeta", vec![1.0, 0.0]).unwrap();
        collection.upsert("alpha", vec![1.0, 0.0]).unwrap();
        collection.upsert("mid", vec![1.0, 0.0]).unwrap();

        let first = collection.top_k(&[1.0, 0.0], 3, None).unwrap();
        let second = collection.top_k(&[1.0, 0.0], 3, None).unwrap();

        let ids: Vec<&str> = first.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        let second_ids: Vec<&str> = second.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, second_ids, "Identical queries return identical order");
    }

    #[test]
    fn test_cosine_metric_normalizes_magnitudes_away() {
        let mut collection = VectorCollection::new("papers", Metric::Cosine, 2);
        collection.upsert("long", vec![100.0, 0.0]).unwrap();
        collection.upsert("short", vec![0.1, 0.0]).unwrap();

        let hits = collection.top_k(&[1.0, 0.0], 2, None).unwrap();
        assert!(
            (hits[0].score - hits[1].score).abs() < 1e-6,
            "Cosine scores ignore vector magnitude"
        );
    }

    #[test]
    fn test_search_rejects_query_dimension_mismatch() {
        let mut collection = VectorCollection::new("papers", Metric::Ip, 3);
        collection.upsert("p1", vec![1.0, 0.0, 0.0]).unwrap();

        assert!(collection.top_k(&[1.0, 0.0], 1, None).is_err());
    }

    #[tokio::test]
    async fn test_save_and_open_preserves_search_results() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_str().unwrap();

        let mut collection = VectorCollection::new("research_papers", Metric::Ip, 2);
        collection.upsert("p1", vec![1.0, 0.0]).unwrap();
        collection.upsert("p2", vec![0.0, 1.0]).unwrap();
        collection.save(data_dir).await.unwrap();

        let store = VectorStore::open(data_dir, &["research_papers"])
            .await
            .unwrap();

        let hits = store
            .search("research_papers", &[1.0, 0.0], 1, None)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "p1");
    }

    #[tokio::test]
    async fn test_open_tolerates_missing_collection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_str().unwrap();

        let store = VectorStore::open(data_dir, &["research_papers"])
            .await
            .expect("Missing collection file is not a startup error");

        let result = store.search("research_papers", &[1.0, 0.0], 5, None).await;
        assert!(result.is_err(), "Searching an unloaded collection fails");
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_collection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_str().unwrap();

        let path = collection_path(data_dir, "research_papers");
        tokio::fs::write(&path, "not json").await.unwrap();

        let result = VectorStore::open(data_dir, &["research_papers"]).await;
        assert!(result.is_err(), "Corrupt collection file is a hard error");
    }

    #[test]
    fn test_collection_path_sanitizes_name() {
        let path = collection_path("/data", "../etc/passwd");
        assert!(path.starts_with("/data/"));
        assert_eq!(
            path,
            PathBuf::from("/data/collection_.._etc_passwd.json")
        );
    }
}
