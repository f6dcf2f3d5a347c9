//! Vector index collaborator: batched upserts and similarity search.
//!
//! The ingestion pipeline only ever performs one batched `upsert` per run;
//! `similarity_search` is the read path consumed by the question-answering
//! layer. [`ChromaVectorStore`] talks to a Chroma server over HTTP;
//! [`MemoryVectorIndex`] keeps everything in process for tests and offline
//! runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::config::VectorConfig;
use crate::embedding::{cosine_similarity, TextEncoder};

/// One ranked hit from a similarity search.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: String,
    pub text: Option<String>,
    pub score: f32,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Insert-or-replace a batch of vectors keyed by id. A no-op when the
    /// store is disabled.
    async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[HashMap<String, String>],
        documents: &[String],
    ) -> Result<()>;

    /// Embed the query text and return the `top_k` nearest entries,
    /// optionally restricted to entries whose metadata contains every
    /// `filter` pair.
    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ScoredHit>>;
}

/// Placeholder used when no vector store is configured.
pub struct DisabledVectorIndex;

#[async_trait]
impl VectorIndex for DisabledVectorIndex {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn upsert(
        &self,
        _ids: &[String],
        _embeddings: &[Vec<f32>],
        _metadatas: &[HashMap<String, String>],
        _documents: &[String],
    ) -> Result<()> {
        Ok(())
    }

    async fn similarity_search(
        &self,
        _query: &str,
        _top_k: usize,
        _filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ScoredHit>> {
        bail!("Vector store is disabled")
    }
}

/// HTTP client for a Chroma collection.
pub struct ChromaVectorStore {
    client: reqwest::Client,
    encoder: Arc<dyn TextEncoder>,
    base_url: String,
    collection_id: Option<String>,
}

impl ChromaVectorStore {
    /// Resolve (or create) the configured collection. Connection failures
    /// disable the store rather than failing the process; ingestion then
    /// records the step as skipped.
    pub async fn connect(config: &VectorConfig, encoder: Arc<dyn TextEncoder>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        let mut store = Self {
            client,
            encoder,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection_id: None,
        };

        if !config.enabled {
            return store;
        }

        match store.resolve_collection(&config.collection).await {
            Ok(id) => store.collection_id = Some(id),
            Err(e) => {
                warn!("vector store unavailable, disabling for this process: {e:#}");
            }
        }
        store
    }

    async fn resolve_collection(&self, name: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/api/v1/collections", self.base_url))
            .json(&serde_json::json!({"name": name, "get_or_create": true}))
            .send()
            .await
            .context("vector store collection request failed")?
            .error_for_status()
            .context("vector store rejected collection request")?;

        let json: serde_json::Value = response.json().await?;
        json.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("vector store returned no collection id"))
    }

    fn collection_url(&self, suffix: &str) -> Result<String> {
        let id = self
            .collection_id
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Vector store is disabled"))?;
        Ok(format!(
            "{}/api/v1/collections/{}/{}",
            self.base_url, id, suffix
        ))
    }
}

#[async_trait]
impl VectorIndex for ChromaVectorStore {
    fn is_enabled(&self) -> bool {
        self.collection_id.is_some()
    }

    async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[HashMap<String, String>],
        documents: &[String],
    ) -> Result<()> {
        if !self.is_enabled() || ids.is_empty() {
            return Ok(());
        }

        self.client
            .post(self.collection_url("upsert")?)
            .json(&serde_json::json!({
                "ids": ids,
                "embeddings": embeddings,
                "metadatas": metadatas,
                "documents": documents,
            }))
            .send()
            .await
            .context("vector upsert request failed")?
            .error_for_status()
            .context("vector store rejected upsert")?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ScoredHit>> {
        if !self.is_enabled() {
            bail!("Vector store is disabled");
        }

        let query_embedding = self
            .encoder
            .encode(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        let mut body = serde_json::json!({
            "query_embeddings": [query_embedding],
            "n_results": top_k,
        });
        if let Some(filter) = filter {
            body["where"] = serde_json::to_value(filter)?;
        }

        let response = self
            .client
            .post(self.collection_url("query")?)
            .json(&body)
            .send()
            .await
            .context("vector query request failed")?
            .error_for_status()
            .context("vector store rejected query")?;
        let json: serde_json::Value = response.json().await?;

        parse_query_response(&json)
    }
}

fn parse_query_response(json: &serde_json::Value) -> Result<Vec<ScoredHit>> {
    let first = |key: &str| -> Option<&serde_json::Value> {
        json.get(key).and_then(|v| v.as_array()).and_then(|v| v.first())
    };
    let ids = first("ids")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("vector store response missing ids"))?;
    let documents = first("documents").and_then(|v| v.as_array());
    let distances = first("distances").and_then(|v| v.as_array());
    let metadatas = first("metadatas").and_then(|v| v.as_array());

    let mut hits = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let id = id
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("vector store returned a non-string id"))?;
        let distance = distances
            .and_then(|d| d.get(index))
            .and_then(|d| d.as_f64())
            .unwrap_or(0.0);
        let metadata = metadatas
            .and_then(|m| m.get(index))
            .and_then(|m| m.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        hits.push(ScoredHit {
            id: id.to_string(),
            text: documents
                .and_then(|d| d.get(index))
                .and_then(|d| d.as_str())
                .map(str::to_string),
            score: 1.0 - distance as f32,
            metadata,
        });
    }
    Ok(hits)
}

#[derive(Clone)]
struct StoredVector {
    embedding: Vec<f32>,
    metadata: HashMap<String, String>,
    document: String,
}

/// In-process vector index with the same contract as the HTTP store.
pub struct MemoryVectorIndex {
    encoder: Arc<dyn TextEncoder>,
    entries: Mutex<HashMap<String, StoredVector>>,
}

impl MemoryVectorIndex {
    pub fn new(encoder: Arc<dyn TextEncoder>) -> Self {
        Self {
            encoder,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored vectors; upserting the same id twice counts once.
    pub fn count(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[HashMap<String, String>],
        documents: &[String],
    ) -> Result<()> {
        if ids.len() != embeddings.len() {
            bail!("ids and embeddings length mismatch");
        }
        let mut entries = self.entries.lock().expect("lock poisoned");
        for (index, id) in ids.iter().enumerate() {
            entries.insert(
                id.clone(),
                StoredVector {
                    embedding: embeddings[index].clone(),
                    metadata: metadatas.get(index).cloned().unwrap_or_default(),
                    document: documents.get(index).cloned().unwrap_or_default(),
                },
            );
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&HashMap<String, String>>,
    ) -> Result<Vec<ScoredHit>> {
        let query_embedding = self
            .encoder
            .encode(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        let entries = self.entries.lock().expect("lock poisoned");
        let mut hits: Vec<ScoredHit> = entries
            .iter()
            .filter(|(_, stored)| match filter {
                Some(filter) => filter
                    .iter()
                    .all(|(k, v)| stored.metadata.get(k) == Some(v)),
                None => true,
            })
            .map(|(id, stored)| ScoredHit {
                id: id.clone(),
                text: Some(stored.document.clone()),
                score: cosine_similarity(&query_embedding, &stored.embedding),
                metadata: stored.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubEncoder;

    #[async_trait]
    impl TextEncoder for StubEncoder {
        fn is_enabled(&self) -> bool {
            true
        }
        fn model_name(&self) -> &str {
            "stub"
        }
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            // Deterministic two-dimensional embedding from text length.
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0])
                .collect())
        }
    }

    #[tokio::test]
    async fn memory_upsert_is_idempotent_by_id() {
        let index = MemoryVectorIndex::new(Arc::new(StubEncoder));
        let ids = vec!["msg:a".to_string()];
        let vectors = vec![vec![1.0, 1.0]];
        let metadata = vec![HashMap::new()];
        let documents = vec!["hello".to_string()];

        index
            .upsert(&ids, &vectors, &metadata, &documents)
            .await
            .unwrap();
        index
            .upsert(&ids, &vectors, &metadata, &documents)
            .await
            .unwrap();
        assert_eq!(index.count(), 1);
    }

    #[tokio::test]
    async fn memory_search_filters_on_metadata() {
        let index = MemoryVectorIndex::new(Arc::new(StubEncoder));
        let mut msg_meta = HashMap::new();
        msg_meta.insert("type".to_string(), "message".to_string());
        let mut img_meta = HashMap::new();
        img_meta.insert("type".to_string(), "image".to_string());

        index
            .upsert(
                &["a".to_string(), "b".to_string()],
                &[vec![5.0, 1.0], vec![5.0, 1.0]],
                &[msg_meta.clone(), img_meta],
                &["msg text".to_string(), "img text".to_string()],
            )
            .await
            .unwrap();

        let hits = index
            .similarity_search("query", 10, Some(&msg_meta))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn chroma_query_response_parses_ranked_hits() {
        let json = serde_json::json!({
            "ids": [["msg:1", "img:2"]],
            "documents": [["hello", "a photo"]],
            "distances": [[0.1, 0.4]],
            "metadatas": [[{"type": "message"}, {"type": "image"}]],
        });
        let hits = parse_query_response(&json).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "msg:1");
        assert!(hits[0].score > hits[1].score);
        assert_eq!(hits[1].metadata.get("type").unwrap(), "image");
    }
}
