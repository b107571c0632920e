//! Per-user namespaced document + embedding store with cosine query
//! (spec.md §4.2).
//!
//! One JSON file per `(userId, namespace)` under the data root, cached in a
//! process-wide map so repeated queries don't re-read from disk — same
//! addressing and cache shape as the session store, generalized to hold a
//! vector of records instead of one.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// The two closed namespaces a per-user store may be addressed under
/// (spec.md §3 "Vector record").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// Durable user knowledge.
    Edubba,
    /// Response traces.
    Mnemosyne,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Edubba => "edubba",
            Self::Mnemosyne => "mnemosyne",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "edubba" => Ok(Self::Edubba),
            "mnemosyne" => Ok(Self::Mnemosyne),
            other => Err(Error::Validation(vec![format!("unknown namespace: {other}")])),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub document: String,
    pub embedding: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub document: String,
    pub metadata: VectorMetadata,
    pub score: f32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: Vec<VectorRecord>,
}

/// Sanitize a caller-supplied user id to `[A-Za-z0-9_-]{1,64}` (spec.md §4.2).
/// Returns `(sanitized, was_mutated)` so callers can log a namespace
/// violation when sanitization changed the input.
pub fn sanitize_user_id(raw: &str) -> (String, bool) {
    let sanitized: String = raw.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').take(64).collect();
    let sanitized = if sanitized.is_empty() { "anonymous".to_string() } else { sanitized };
    let mutated = sanitized != raw;
    (sanitized, mutated)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Process-wide cache of per-`(userId, namespace)` stores.
pub struct VectorStore {
    root: PathBuf,
    cache: DashMap<(String, &'static str), Arc<RwLock<StoreFile>>>,
}

impl VectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), cache: DashMap::new() }
    }

    fn path(&self, user_id: &str, namespace: Namespace) -> PathBuf {
        self.root.join(user_id).join(format!("{}.json", namespace.as_str()))
    }

    async fn handle(&self, user_id: &str, namespace: Namespace) -> Result<Arc<RwLock<StoreFile>>> {
        let key = (user_id.to_string(), namespace.as_str());
        if let Some(existing) = self.cache.get(&key) {
            return Ok(existing.clone());
        }

        let loaded = match fs::read_to_string(self.path(user_id, namespace)).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::Internal(format!("corrupt vector store file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };

        let handle = Arc::new(RwLock::new(loaded));
        self.cache.insert(key, handle.clone());
        Ok(handle)
    }

    /// Anonymous/guest callers are refused at the caller boundary (spec.md
    /// §4.2); this store has no notion of "guest" and always trusts its
    /// `user_id` argument has already been authorized.
    pub async fn add(
        &self,
        user_id: &str,
        namespace: Namespace,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadata: Vec<VectorMetadata>,
    ) -> Result<usize> {
        if documents.len() != embeddings.len() || documents.len() != metadata.len() {
            return Err(Error::Validation(vec![
                "documents, embeddings, and metadata must have equal length".into(),
            ]));
        }

        let handle = self.handle(user_id, namespace).await?;
        let mut store = handle.write().await;
        let mut added = 0;
        for ((document, embedding), meta) in documents.into_iter().zip(embeddings).zip(metadata) {
            if embedding.is_empty() {
                // missing embedding for this document is dropped silently (spec.md §4.2)
                continue;
            }
            store.records.push(VectorRecord { document, embedding, metadata: meta });
            added += 1;
        }
        drop(store);
        self.persist(user_id, namespace, &handle).await?;
        Ok(added)
    }

    pub async fn query(
        &self,
        user_id: &str,
        namespace: Namespace,
        embedding: Option<&[f32]>,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<QueryResult>> {
        let Some(embedding) = embedding else { return Ok(Vec::new()) };

        let handle = self.handle(user_id, namespace).await?;
        let store = handle.read().await;
        let mut scored: Vec<QueryResult> = store
            .records
            .iter()
            .map(|r| QueryResult {
                document: r.document.clone(),
                metadata: r.metadata.clone(),
                score: cosine(embedding, &r.embedding),
            })
            .filter(|r| r.score >= threshold)
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn clear(&self, user_id: &str, namespace: Namespace) -> Result<()> {
        let handle = self.handle(user_id, namespace).await?;
        handle.write().await.records.clear();
        self.persist(user_id, namespace, &handle).await
    }

    pub async fn count(&self, user_id: &str, namespace: Namespace) -> Result<usize> {
        let handle = self.handle(user_id, namespace).await?;
        Ok(handle.read().await.records.len())
    }

    async fn persist(&self, user_id: &str, namespace: Namespace, handle: &Arc<RwLock<StoreFile>>) -> Result<()> {
        let path = self.path(user_id, namespace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = {
            let store = handle.read().await;
            serde_json::to_string_pretty(&*store)
                .map_err(|e| Error::Internal(format!("failed to serialize vector store: {e}")))?
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> VectorMetadata {
        VectorMetadata { timestamp: Some(chrono::Utc::now()), ..Default::default() }
    }

    #[tokio::test]
    async fn add_then_query_returns_closest_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        store
            .add(
                "u1",
                Namespace::Edubba,
                vec!["a".into(), "b".into()],
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
                vec![meta(), meta()],
            )
            .await
            .unwrap();

        let results = store.query("u1", Namespace::Edubba, Some(&[1.0, 0.0]), 5, 0.0).await.unwrap();
        assert_eq!(results[0].document, "a");
    }

    #[tokio::test]
    async fn mismatched_lengths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        let result = store.add("u1", Namespace::Edubba, vec!["a".into()], vec![], vec![meta()]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn null_embedding_query_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        let results = store.query("u1", Namespace::Edubba, None, 5, 0.0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn stores_are_isolated_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        store.add("a", Namespace::Edubba, vec!["secret".into()], vec![vec![1.0]], vec![meta()]).await.unwrap();
        let count = store.count("b", Namespace::Edubba).await.unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn sanitize_strips_disallowed_characters() {
        let (sanitized, mutated) = sanitize_user_id("user@example.com");
        assert_eq!(sanitized, "userexamplecom");
        assert!(mutated);
    }

    #[test]
    fn cosine_zero_norm_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
