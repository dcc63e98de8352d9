pub mod cache;
pub mod doc_embeddings;
pub mod embedder;
pub mod embeddings;
pub mod file_index;
pub mod index_manager;
pub mod provider;
pub mod recommender;
pub mod retriever;
pub mod retry;
pub mod similarity;
mod snapshot;
pub mod vector_store;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{IndexBackend, Settings};
use crate::error::{Error, Result};
use crate::models::{RecommendationCandidate, RetrievalOutcome, UserHistoryEntry};
use self::cache::EmbeddingCache;
use self::doc_embeddings::DocumentEmbeddingStore;
use self::embedder::{BatchOptions, Embedder, EmbedderSet};
use self::embeddings::LocalProvider;
use self::file_index::FileIndex;
use self::index_manager::{IndexReport, IndexStatus, KnowledgeBaseIndexer};
use self::provider::{EmbeddingProvider, OpenAiProvider};
use self::recommender::RecommendationEngine;
use self::retriever::RetrievalEngine;
use self::vector_store::{QdrantIndex, VectorIndex};

/// Entry point wiring the indexer, retrieval and recommendation engines
/// over one set of embedders and one index.
pub struct RagEngine {
    indexer: Arc<KnowledgeBaseIndexer>,
    retriever: RetrievalEngine,
    recommender: RecommendationEngine,
}

impl RagEngine {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let primary = OpenAiProvider::new(
            settings.embedding.base_url.clone(),
            settings.embedding.api_key.clone(),
            settings.embedding.model.clone(),
            Duration::from_secs(settings.embedding.timeout_secs),
        )
        .map_err(|e| Error::Config(format!("Failed to build embeddings client: {}", e)))?
        .with_dimension(settings.embedding.dimension);
        let primary = build_embedder(Arc::new(primary), settings).await?;

        let fallback = if settings.fallback.enabled {
            let local = LocalProvider::new(
                settings.fallback.model_dir.clone(),
                settings.fallback.model_name.clone(),
            );
            if !local.is_available() {
                tracing::warn!(
                    "Fallback model files not found in {}",
                    settings.fallback.model_dir.display()
                );
            }
            Some(build_embedder(Arc::new(local), settings).await?)
        } else {
            None
        };
        tracing::info!(
            "Embedding with {} (available: {}), fallback: {}",
            primary.model(),
            primary.is_available(),
            fallback
                .as_ref()
                .map(|f| f.model().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        let index: Arc<dyn VectorIndex> = match settings.index.backend {
            IndexBackend::File => Arc::new(FileIndex::new(settings.index_path())),
            IndexBackend::Qdrant => Arc::new(
                QdrantIndex::new(
                    &settings.index.qdrant_url,
                    &settings.index.collection,
                    settings.manifest_path(),
                )
                .await?,
            ),
        };

        Ok(Self::new(settings, EmbedderSet::new(primary, fallback), index))
    }

    /// Assembles the engine from already-built parts.
    pub fn new(settings: &Settings, embedders: EmbedderSet, index: Arc<dyn VectorIndex>) -> Self {
        let doc_store = Arc::new(DocumentEmbeddingStore::new(settings.doc_embeddings_path()));
        let indexer = Arc::new(KnowledgeBaseIndexer::new(
            settings.paths.kb_dir.clone(),
            settings.index.chunk_size,
            settings.index.chunk_overlap,
            embedders.clone(),
            index,
            doc_store.clone(),
        ));
        Self {
            retriever: RetrievalEngine::new(indexer.clone(), settings.retrieval.distance_threshold),
            recommender: RecommendationEngine::new(embedders, doc_store),
            indexer,
        }
    }

    pub fn indexer(&self) -> &Arc<KnowledgeBaseIndexer> {
        &self.indexer
    }

    pub async fn build_index(&self, chunk_size: usize, chunk_overlap: usize) -> Result<IndexReport> {
        self.indexer.build_index(chunk_size, chunk_overlap).await
    }

    pub async fn index_status(&self) -> IndexStatus {
        self.indexer.get_status().await
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<RetrievalOutcome> {
        self.retriever.retrieve(query, k).await
    }

    /// Recommends unseen documents, rebuilding first when no document table
    /// matching the published index exists.
    pub async fn recommend(
        &self,
        history: &[UserHistoryEntry],
        current_query: &str,
        k: usize,
        alpha: f32,
    ) -> Result<Vec<RecommendationCandidate>> {
        match self.recommender.recommend(history, current_query, k, alpha).await {
            Err(Error::IndexNotFound) => {
                self.indexer.ensure_document_table().await?;
                self.recommender.recommend(history, current_query, k, alpha).await
            }
            other => other,
        }
    }
}

async fn build_embedder(provider: Arc<dyn EmbeddingProvider>, settings: &Settings) -> Result<Arc<Embedder>> {
    let cache = EmbeddingCache::open(settings.cache_dir(), provider.model(), provider.dimension()).await?;
    Ok(Arc::new(Embedder::new(
        provider,
        Arc::new(cache),
        settings.embedding.retry.policy(),
        BatchOptions {
            batch_size: settings.embedding.batch_size,
            max_concurrent_batches: settings.embedding.max_concurrent_batches,
        },
    )))
}
