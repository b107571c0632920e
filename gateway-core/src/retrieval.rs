//! Retrieval layer: query embedding, top-K retrieval, file-upload ingest,
//! and session-history compaction (spec.md §4.6 "Retrieval" stage, §6
//! `/api/embed`, `/api/ingest`, `/api/rag/*`).

use async_trait::async_trait;

use crate::audit::{AuditEntry, AuditLogger, AuditResult};
use crate::error::{Error, Result};
use crate::vector_store::{sanitize_user_id, Namespace, QueryResult, VectorMetadata, VectorStore};

/// Seam over the local backend's embedding endpoint, grounded on
/// SPEC_FULL.md's note that backend interactions are tested through trait
/// seams with an in-memory fake rather than a stub HTTP server.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Production embedding client backed by the configured backend HTTP endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    embed_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(client: reqwest::Client, embed_url: String) -> Self {
        Self { client, embed_url }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            input: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            embedding: Vec<f32>,
        }

        let resp = self
            .client
            .post(&self.embed_url)
            .json(&Req { input: text })
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("embedding backend unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Upstream(format!("embedding backend returned {}", resp.status())));
        }

        resp.json::<Resp>()
            .await
            .map(|r| r.embedding)
            .map_err(|e| Error::Upstream(format!("malformed embedding response: {e}")))
    }
}

pub struct RetrievalLayer<'a> {
    store: &'a VectorStore,
    embedder: &'a dyn EmbeddingClient,
    audit: Option<&'a AuditLogger>,
}

impl<'a> RetrievalLayer<'a> {
    pub fn new(store: &'a VectorStore, embedder: &'a dyn EmbeddingClient) -> Self {
        Self { store, embedder, audit: None }
    }

    /// Same as [`Self::new`] but logs a `namespace_sanitized` audit entry
    /// whenever `sanitize_user_id` mutates the caller-supplied id (spec.md
    /// §4.2: "any change during sanitization is logged as a namespace
    /// violation").
    pub fn with_audit(store: &'a VectorStore, embedder: &'a dyn EmbeddingClient, audit: &'a AuditLogger) -> Self {
        Self { store, embedder, audit: Some(audit) }
    }

    async fn log_sanitization(&self, raw_user_id: &str, sanitized_user_id: &str, mutated: bool) {
        if !mutated {
            return;
        }
        if let Some(audit) = self.audit {
            let _ = audit
                .log(
                    AuditEntry::new("retrieval", "namespace_sanitized", AuditResult::Denied)
                        .with_user_id(sanitized_user_id)
                        .with_meta(serde_json::json!({ "raw_user_id": raw_user_id })),
                )
                .await;
        }
    }

    /// Ingest a chunked document into the caller's namespace. `chunks` are
    /// embedded individually so each carries its own `chunk_index` metadata.
    pub async fn ingest(
        &self,
        user_id: &str,
        namespace: Namespace,
        file_id: &str,
        chunks: Vec<String>,
    ) -> Result<usize> {
        let raw_user_id = user_id;
        let (user_id, mutated) = sanitize_user_id(user_id);
        self.log_sanitization(raw_user_id, &user_id, mutated).await;
        let mut embeddings = Vec::with_capacity(chunks.len());
        let mut metadata = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            let embedding = self.embedder.embed(chunk).await.unwrap_or_default();
            embeddings.push(embedding);
            metadata.push(VectorMetadata {
                timestamp: Some(chrono::Utc::now()),
                file_id: Some(file_id.to_string()),
                chunk_index: Some(i as u32),
                session_id: None,
            });
        }
        self.store.add(&user_id, namespace, chunks, embeddings, metadata).await
    }

    /// Retrieval pipeline stage (spec.md §4.6): embed the last user message
    /// and return the top-K records above `threshold`.
    pub async fn retrieve(
        &self,
        user_id: &str,
        namespace: Namespace,
        query: &str,
        top_k: u32,
        threshold: f32,
    ) -> Result<Vec<QueryResult>> {
        let raw_user_id = user_id;
        let (user_id, mutated) = sanitize_user_id(user_id);
        self.log_sanitization(raw_user_id, &user_id, mutated).await;
        let embedding = self.embedder.embed(query).await.ok();
        self.store.query(&user_id, namespace, embedding.as_deref(), top_k as usize, threshold).await
    }

    /// Store one assistant/user turn pair in the caller's response-trace
    /// namespace (spec.md §4.7 step 9: "optionally embed the assistant
    /// reply and store it in the caller's response-trace namespace").
    pub async fn record_turn(&self, user_id: &str, session_id: &str, assistant_reply: &str) -> Result<()> {
        let raw_user_id = user_id;
        let (user_id, mutated) = sanitize_user_id(user_id);
        self.log_sanitization(raw_user_id, &user_id, mutated).await;
        let embedding = self.embedder.embed(assistant_reply).await.unwrap_or_default();
        self.store
            .add(
                &user_id,
                Namespace::Mnemosyne,
                vec![assistant_reply.to_string()],
                vec![embedding],
                vec![VectorMetadata {
                    timestamp: Some(chrono::Utc::now()),
                    session_id: Some(session_id.to_string()),
                    file_id: None,
                    chunk_index: None,
                }],
            )
            .await?;
        Ok(())
    }
}

/// Bound recent chat history to the capability profile's `history_turns`
/// (spec.md §4.6 "Memory/context" stage). Keeps the most recent turns.
pub fn compact_history<T>(turns: Vec<T>, max_turns: u32) -> Vec<T> {
    let max_turns = max_turns as usize;
    if turns.len() <= max_turns {
        return turns;
    }
    let skip = turns.len() - max_turns;
    turns.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeEmbedder(Mutex<Vec<f32>>);

    #[async_trait]
    impl EmbeddingClient for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn ingest_then_retrieve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path());
        let embedder = FakeEmbedder(Mutex::new(vec![1.0, 0.0]));
        let layer = RetrievalLayer::new(&store, &embedder);

        layer.ingest("u1", Namespace::Edubba, "file-1", vec!["chunk one".into()]).await.unwrap();
        let results = layer.retrieve("u1", Namespace::Edubba, "chunk one", 5, 0.0).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn compact_history_keeps_most_recent() {
        let history = vec![1, 2, 3, 4, 5];
        assert_eq!(compact_history(history, 2), vec![4, 5]);
    }

    #[test]
    fn compact_history_is_noop_when_under_limit() {
        let history = vec![1, 2];
        assert_eq!(compact_history(history, 10), vec![1, 2]);
    }
}
