use std::sync::Arc;

use super::index_manager::KnowledgeBaseIndexer;
use crate::error::{Error, Result};
use crate::models::{RetrievalOutcome, Snippet};

/// Nearest distance above which a query counts as out of scope. Calibrated
/// for `text-embedding-3-small` under squared Euclidean distance.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 1.25;

/// k-NN retrieval over the published chunk index with an out-of-scope gate.
pub struct RetrievalEngine {
    indexer: Arc<KnowledgeBaseIndexer>,
    distance_threshold: f32,
}

impl RetrievalEngine {
    pub fn new(indexer: Arc<KnowledgeBaseIndexer>, distance_threshold: f32) -> Self {
        Self {
            indexer,
            distance_threshold,
        }
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalOutcome> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be at least 1".into()));
        }

        let manifest = self.indexer.ensure_index().await?;
        let embedder = self.indexer.embedders().for_model(&manifest.model)?;
        let query_vector = embedder.embed(query).await?;
        if query_vector.len() != manifest.dimension {
            return Err(Error::DimensionMismatch {
                expected: manifest.dimension,
                actual: query_vector.len(),
            });
        }

        let hits = self.indexer.index().search(&query_vector, k).await?;
        let Some(nearest) = hits.first().map(|h| h.distance) else {
            tracing::info!("Query out of scope: no neighbours");
            return Ok(RetrievalOutcome::out_of_scope());
        };
        if nearest > self.distance_threshold {
            tracing::info!(
                "Query out of scope: nearest distance {:.4} > {}",
                nearest,
                self.distance_threshold
            );
            return Ok(RetrievalOutcome::out_of_scope());
        }

        tracing::debug!(
            "Retrieved {} snippets, nearest distance {:.4}",
            hits.len(),
            nearest
        );
        Ok(RetrievalOutcome {
            snippets: hits
                .into_iter()
                .map(|h| Snippet {
                    text: h.chunk.text,
                    distance: h.distance,
                    source: h.chunk.source,
                })
                .collect(),
            in_scope: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DistanceMetric, IndexManifest, IndexedChunk};
    use crate::rag::doc_embeddings::DocumentEmbeddingStore;
    use crate::rag::embedder::tests::{test_embedder, CountingProvider};
    use crate::rag::embedder::EmbedderSet;
    use crate::rag::file_index::FileIndex;
    use crate::rag::vector_store::VectorIndex;

    fn manifest(model: &str) -> IndexManifest {
        IndexManifest {
            provider: "counting".into(),
            model: model.into(),
            dimension: 2,
            metric: DistanceMetric::SquaredEuclidean,
            chunk_size: 800,
            chunk_overlap: 100,
            documents: 2,
            chunks: 3,
            built_at: chrono::Utc::now(),
        }
    }

    fn entry(seq: u64, source: &str, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk: Chunk::new(seq, format!("chunk text {}", seq), source.into()),
            embedding,
        }
    }

    /// Index with fixed vectors and a provider that maps known queries onto
    /// chosen points.
    async fn engine(tmp: &tempfile::TempDir, threshold: f32) -> RetrievalEngine {
        let provider = CountingProvider::new(2)
            .with_vector("near", vec![1.0, 0.1])
            .with_vector("tie", vec![0.0, 0.0])
            .with_vector("far", vec![5.0, 5.0]);
        let embedder = test_embedder(std::sync::Arc::new(provider), &tmp.path().join("cache")).await;

        let index = Arc::new(FileIndex::new(tmp.path().join("index.json")));
        index
            .publish(
                manifest("counting-model"),
                vec![
                    entry(0, "a.md", vec![1.0, 0.0]),
                    entry(1, "b.md", vec![0.0, 1.0]),
                    entry(2, "a.md", vec![1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let indexer = KnowledgeBaseIndexer::new(
            tmp.path().join("kb"),
            800,
            100,
            EmbedderSet::new(embedder, None),
            index,
            Arc::new(DocumentEmbeddingStore::new(tmp.path().join("docs.json"))),
        );
        RetrievalEngine::new(Arc::new(indexer), threshold)
    }

    #[tokio::test]
    async fn test_in_scope_results_sorted_and_limited() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp, DEFAULT_DISTANCE_THRESHOLD).await;

        let outcome = engine.retrieve("near", 2).await.unwrap();
        assert!(outcome.in_scope);
        assert_eq!(outcome.snippets.len(), 2);
        assert!(outcome.snippets[0].distance <= outcome.snippets[1].distance);
        assert_eq!(outcome.snippets[0].text, "chunk text 0");
        assert_eq!(outcome.snippets[1].text, "chunk text 2");
        assert_eq!(outcome.references(), vec!["a.md".to_string()]);
    }

    #[tokio::test]
    async fn test_equal_distances_keep_insertion_order() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp, DEFAULT_DISTANCE_THRESHOLD).await;

        let outcome = engine.retrieve("tie", 3).await.unwrap();
        let texts = outcome.snippet_texts();
        assert_eq!(texts, vec!["chunk text 0", "chunk text 1", "chunk text 2"]);
        assert_eq!(outcome.references(), vec!["a.md".to_string(), "b.md".to_string()]);
    }

    #[tokio::test]
    async fn test_far_query_is_out_of_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp, DEFAULT_DISTANCE_THRESHOLD).await;

        let outcome = engine.retrieve("far", 3).await.unwrap();
        assert!(!outcome.in_scope);
        assert!(outcome.snippets.is_empty());
        assert!(outcome.references().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let tmp = tempfile::tempdir().unwrap();
        // "tie" sits at distance exactly 1.0 from every chunk
        let engine = engine(&tmp, 1.0).await;
        assert!(engine.retrieve("tie", 1).await.unwrap().in_scope);

        let tmp = tempfile::tempdir().unwrap();
        let engine = self::engine(&tmp, 0.99).await;
        assert!(!engine.retrieve("tie", 1).await.unwrap().in_scope);
    }

    #[tokio::test]
    async fn test_zero_k_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(&tmp, DEFAULT_DISTANCE_THRESHOLD).await;
        assert!(matches!(
            engine.retrieve("near", 0).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_index_from_unknown_model_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = test_embedder(
            std::sync::Arc::new(CountingProvider::new(2)),
            &tmp.path().join("cache"),
        )
        .await;
        let index = Arc::new(FileIndex::new(tmp.path().join("index.json")));
        index
            .publish(manifest("some-other-model"), vec![entry(0, "a.md", vec![1.0, 0.0])])
            .await
            .unwrap();
        let indexer = KnowledgeBaseIndexer::new(
            tmp.path().join("kb"),
            800,
            100,
            EmbedderSet::new(embedder, None),
            index,
            Arc::new(DocumentEmbeddingStore::new(tmp.path().join("docs.json"))),
        );
        let engine = RetrievalEngine::new(Arc::new(indexer), DEFAULT_DISTANCE_THRESHOLD);
        assert!(matches!(engine.retrieve("q", 1).await, Err(Error::Config(_))));
    }
}
