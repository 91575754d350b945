use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Maximum snippet length in characters for presentation metadata.
const SNIPPET_MAX_CHARS: usize = 100;

/// A research paper's metadata as loaded from the corpus CSV.
/// Records are immutable once loaded; the query path never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    pub title: String,
    /// Abstract text. The corpus CSV calls this column `description`.
    #[serde(alias = "description", alias = "abstract")]
    pub summary: String,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

impl PaperRecord {
    /// Short presentation snippet: abstract truncated to ~100 characters
    /// with newlines collapsed to spaces.
    pub fn snippet(&self) -> String {
        let collapsed = normalize_whitespace(&self.summary);
        let mut snippet: String = collapsed.chars().take(SNIPPET_MAX_CHARS).collect();
        if collapsed.chars().count() > SNIPPET_MAX_CHARS {
            snippet.push_str("...");
        }
        snippet
    }
}

/// In-memory lookup of paper metadata keyed by paper id.
/// Loaded once at startup from the corpus CSV; shared read-only afterwards.
pub struct PaperStore {
    papers: HashMap<String, PaperRecord>,
    fingerprint: String,
    source_path: String,
}

impl PaperStore {
    pub async fn load(path: &str) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read corpus CSV at {path}"))?;

        let fingerprint = compute_corpus_fingerprint(&data);

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(data.as_slice());

        let mut papers: HashMap<String, PaperRecord> = HashMap::new();
        for row in reader.deserialize::<PaperRecord>() {
            let record = row.with_context(|| format!("Malformed row in corpus CSV {path}"))?;
            if record.id.is_empty() {
                tracing::warn!("Skipping corpus row with empty paper id");
                continue;
            }
            if papers.insert(record.id.clone(), record).is_some() {
                tracing::warn!("Duplicate paper id in corpus CSV; keeping the later row");
            }
        }

        if papers.is_empty() {
            return Err(anyhow::anyhow!("Corpus CSV {path} contains no papers"));
        }

        tracing::info!(
            "Loaded {} papers from {} (fingerprint {})",
            papers.len(),
            path,
            &fingerprint[..12]
        );

        Ok(Self {
            papers,
            fingerprint,
            source_path: path.to_string(),
        })
    }

    pub fn get(&self, id: &str) -> Option<&PaperRecord> {
        self.papers.get(id)
    }

    pub fn len(&self) -> usize {
        self.papers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.papers.is_empty()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    #[cfg(test)]
    pub fn from_records(records: Vec<PaperRecord>) -> Self {
        let papers = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Self {
            papers,
            fingerprint: "test".to_string(),
            source_path: "test.csv".to_string(),
        }
    }
}

fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compute_corpus_fingerprint(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_corpus(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("papers.csv");
        let mut file = std::fs::File::create(&path).expect("Failed to create corpus file");
        file.write_all(contents.as_bytes())
            .expect("Failed to write corpus file");
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[tokio::test]
    async fn test_load_corpus_with_description_column() {
        let (_dir, path) = write_corpus(
            "id,title,description\n\
             2301.00001,Attention Survey,A survey of attention mechanisms in transformers.\n\
             2301.00002,Sparse Retrieval,Lexical retrieval revisited with learned sparse terms.\n",
        );

        let store = PaperStore::load(&path).await.expect("Corpus should load");

        assert_eq!(store.len(), 2);
        let paper = store.get("2301.00001").expect("Paper should be present");
        assert_eq!(paper.title, "Attention Survey");
        assert!(paper.summary.starts_with("A survey"));
    }

    #[tokio::test]
    async fn test_load_corpus_with_optional_columns() {
        let (_dir, path) = write_corpus(
            "id,title,description,authors,link\n\
             2301.00003,Graph Models,Message passing at scale.,Doe et al.,https://arxiv.org/abs/2301.00003\n",
        );

        let store = PaperStore::load(&path).await.expect("Corpus should load");
        let paper = store.get("2301.00003").unwrap();

        assert_eq!(paper.authors.as_deref(), Some("Doe et al."));
        assert_eq!(
            paper.link.as_deref(),
            Some("https://arxiv.org/abs/2301.00003")
        );
    }

    #[tokio::test]
    async fn test_empty_corpus_is_an_error() {
        let (_dir, path) = write_corpus("id,title,description\n");

        let result = PaperStore::load(&path).await;
        assert!(result.is_err(), "Empty corpus should fail to load");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let result = PaperStore::load("/nonexistent/papers.csv").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_changes_with_content() {
        let (_dir_a, path_a) = write_corpus("id,title,description\np1,T,first corpus\n");
        let (_dir_b, path_b) = write_corpus("id,title,description\np1,T,second corpus\n");

        let store_a = PaperStore::load(&path_a).await.unwrap();
        let store_b = PaperStore::load(&path_b).await.unwrap();

        assert_ne!(store_a.fingerprint(), store_b.fingerprint());
    }

    #[test]
    fn test_snippet_truncates_and_collapses_newlines() {
        let record = PaperRecord {
            id: "p1".to_string(),
            title: "T".to_string(),
            summary: format!("line one\nline two {}", "x".repeat(200)),
            authors: None,
            link: None,
        };

        let snippet = record.snippet();
        assert!(snippet.ends_with("..."));
        assert!(!snippet.contains('\n'));
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS + 3);
    }

    #[test]
    fn test_snippet_short_abstract_unchanged() {
        let record = PaperRecord {
            id: "p1".to_string(),
            title: "T".to_string(),
            summary: "Short abstract.".to_string(),
            authors: None,
            link: None,
        };

        assert_eq!(record.snippet(), "Short abstract.");
    }
}
