//! Vector index seam
//!
//! The embedding store lives outside this crate; the engine only needs nearest-neighbour
//! lookups by document key. [`InMemoryVectorIndex`] backs tests and small local setups.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::domain::documents::{DocumentKey, StoredDocument};
use crate::error::Result;

/// One nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub key: DocumentKey,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Up to `k` documents nearest to `document`, most similar first
    ///
    /// Hits may include the document itself or other workspaces' documents; callers
    /// filter.
    async fn nearest(
        &self,
        workspace_id: &str,
        document: &StoredDocument,
        k: usize,
    ) -> Result<Vec<VectorHit>>;
}

/// Embeddings held in memory, keyed by workspace and document key
#[derive(Default)]
pub struct InMemoryVectorIndex {
    embeddings: RwLock<HashMap<String, HashMap<DocumentKey, Vec<f32>>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, workspace_id: &str, key: DocumentKey, embedding: Vec<f32>) {
        let mut embeddings = self.embeddings.write().await;
        embeddings
            .entry(workspace_id.to_string())
            .or_default()
            .insert(key, embedding);
    }

    pub async fn remove(&self, workspace_id: &str, key: &DocumentKey) -> bool {
        let mut embeddings = self.embeddings.write().await;
        embeddings
            .get_mut(workspace_id)
            .is_some_and(|ws| ws.remove(key).is_some())
    }

    pub async fn len(&self, workspace_id: &str) -> usize {
        let embeddings = self.embeddings.read().await;
        embeddings.get(workspace_id).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn nearest(
        &self,
        workspace_id: &str,
        document: &StoredDocument,
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let embeddings = self.embeddings.read().await;
        let Some(workspace) = embeddings.get(workspace_id) else {
            return Ok(Vec::new());
        };
        let key = document.key();
        let Some(query) = workspace.get(&key) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = workspace
            .iter()
            .map(|(other, embedding)| VectorHit {
                key: other.clone(),
                similarity: cosine_similarity(query, embedding),
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::documents::Document;
    use chrono::Utc;

    fn stored(source_type: &str, source_id: &str) -> StoredDocument {
        let document = Document::new("ws", source_type, source_id);
        StoredDocument {
            id: format!("{}-{}", source_type, source_id),
            content_hash: document.content_hash(),
            document,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_nearest_orders_by_similarity() {
        let index = InMemoryVectorIndex::new();
        index.upsert("ws", DocumentKey::new("zendesk", "1"), vec![1.0, 0.0]).await;
        index.upsert("ws", DocumentKey::new("github", "a/b:src/x.rs"), vec![0.9, 0.1]).await;
        index.upsert("ws", DocumentKey::new("notion", "p"), vec![0.0, 1.0]).await;

        let hits = index.nearest("ws", &stored("zendesk", "1"), 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, DocumentKey::new("zendesk", "1"));
        assert_eq!(hits[1].key, DocumentKey::new("github", "a/b:src/x.rs"));
    }

    #[tokio::test]
    async fn test_unknown_document_has_no_hits() {
        let index = InMemoryVectorIndex::new();
        index.upsert("ws", DocumentKey::new("notion", "p"), vec![0.0, 1.0]).await;

        assert!(index.nearest("ws", &stored("zendesk", "9"), 5).await.unwrap().is_empty());
        assert!(index.nearest("other", &stored("notion", "p"), 5).await.unwrap().is_empty());
        assert_eq!(index.len("ws").await, 1);
        assert!(index.remove("ws", &DocumentKey::new("notion", "p")).await);
    }
}
