use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::doc_embeddings::{DocumentEmbeddingStore, DocumentEmbeddingTable};
use super::embedder::{Embedder, EmbedderSet};
use super::vector_store::VectorIndex;
use crate::error::{Error, Result};
use crate::indexer::chunker::chunk_text;
use crate::indexer::walker::load_documents;
use crate::models::{Chunk, DistanceMetric, IndexManifest, IndexedChunk};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatus {
    pub is_indexing: bool,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub documents: usize,
    pub chunks: usize,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub last_error: Option<String>,
}

/// Summary of one successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub documents: usize,
    pub chunks: usize,
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub used_fallback: bool,
    pub elapsed_ms: u64,
}

/// Builds the chunk index and the document-embedding table from the
/// markdown knowledge base. Builds are full rebuilds and run one at a time.
pub struct KnowledgeBaseIndexer {
    kb_dir: PathBuf,
    chunk_size: usize,
    chunk_overlap: usize,
    embedders: EmbedderSet,
    index: Arc<dyn VectorIndex>,
    doc_store: Arc<DocumentEmbeddingStore>,
    build_lock: Mutex<()>,
    status: Mutex<IndexStatus>,
}

impl KnowledgeBaseIndexer {
    pub fn new(
        kb_dir: impl Into<PathBuf>,
        chunk_size: usize,
        chunk_overlap: usize,
        embedders: EmbedderSet,
        index: Arc<dyn VectorIndex>,
        doc_store: Arc<DocumentEmbeddingStore>,
    ) -> Self {
        Self {
            kb_dir: kb_dir.into(),
            chunk_size,
            chunk_overlap,
            embedders,
            index,
            doc_store,
            build_lock: Mutex::new(()),
            status: Mutex::new(IndexStatus::default()),
        }
    }

    pub fn kb_dir(&self) -> &Path {
        &self.kb_dir
    }

    pub fn embedders(&self) -> &EmbedderSet {
        &self.embedders
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn doc_store(&self) -> &Arc<DocumentEmbeddingStore> {
        &self.doc_store
    }

    pub fn default_chunking(&self) -> (usize, usize) {
        (self.chunk_size, self.chunk_overlap)
    }

    /// Status of the last build in this process, or of the published index
    /// when nothing has been built yet.
    pub async fn get_status(&self) -> IndexStatus {
        let mut status = self.status.lock().await.clone();
        if status.last_indexed_at.is_none() && !status.is_indexing {
            match self.index.manifest().await {
                Ok(Some(manifest)) => {
                    status.last_indexed_at = Some(manifest.built_at);
                    status.documents = manifest.documents;
                    status.chunks = manifest.chunks;
                    status.provider = Some(manifest.provider);
                    status.model = Some(manifest.model);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Could not read index manifest: {}", e),
            }
        }
        status
    }

    /// Rebuilds everything. Fails with `IndexingInProgress` if another build
    /// holds the lock.
    pub async fn build_index(&self, chunk_size: usize, chunk_overlap: usize) -> Result<IndexReport> {
        let _guard = self
            .build_lock
            .try_lock()
            .map_err(|_| Error::IndexingInProgress)?;
        self.run_build(chunk_size, chunk_overlap).await
    }

    /// Manifest of the published index, building one with the default
    /// chunking if none exists. Waits for a build already under way.
    pub async fn ensure_index(&self) -> Result<IndexManifest> {
        if let Some(manifest) = self.index.manifest().await? {
            return Ok(manifest);
        }

        let _guard = self.build_lock.lock().await;
        if let Some(manifest) = self.index.manifest().await? {
            return Ok(manifest);
        }
        tracing::info!("No vector index found, building one on demand");
        self.run_build(self.chunk_size, self.chunk_overlap).await?;
        self.index.manifest().await?.ok_or(Error::IndexNotFound)
    }

    /// Document table of the published index, rebuilding when the table is
    /// missing or was produced by a different model than the index.
    pub async fn ensure_document_table(&self) -> Result<Arc<DocumentEmbeddingTable>> {
        if let Some(table) = self.matching_table().await? {
            return Ok(table);
        }

        let _guard = self.build_lock.lock().await;
        if let Some(table) = self.matching_table().await? {
            return Ok(table);
        }
        tracing::info!("Document table missing or out of date, rebuilding the index");
        self.run_build(self.chunk_size, self.chunk_overlap).await?;
        self.doc_store.load().await?.ok_or(Error::IndexNotFound)
    }

    async fn matching_table(&self) -> Result<Option<Arc<DocumentEmbeddingTable>>> {
        let Some(manifest) = self.index.manifest().await? else {
            return Ok(None);
        };
        Ok(self
            .doc_store
            .load()
            .await?
            .filter(|t| t.model == manifest.model && t.dimension == manifest.dimension))
    }

    async fn run_build(&self, chunk_size: usize, chunk_overlap: usize) -> Result<IndexReport> {
        {
            let mut status = self.status.lock().await;
            status.is_indexing = true;
            status.last_error = None;
        }

        // is_indexing must reset even if chunking or a provider panics
        let result = std::panic::AssertUnwindSafe(self.do_build(chunk_size, chunk_overlap))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_info| {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(Error::KnowledgeBase(format!("Indexing panicked: {}", msg)))
            });

        let mut status = self.status.lock().await;
        status.is_indexing = false;
        match &result {
            Ok(report) => {
                status.last_indexed_at = Some(Utc::now());
                status.documents = report.documents;
                status.chunks = report.chunks;
                status.provider = Some(report.provider.clone());
                status.model = Some(report.model.clone());
            }
            Err(e) => {
                tracing::error!("Indexing failed: {}", e);
                status.last_error = Some(e.to_string());
            }
        }
        result
    }

    async fn do_build(&self, chunk_size: usize, chunk_overlap: usize) -> Result<IndexReport> {
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk_size must be at least 1".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::InvalidArgument(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }

        let started = Instant::now();
        tracing::info!(
            "Indexing {} (chunk_size={}, chunk_overlap={})",
            self.kb_dir.display(),
            chunk_size,
            chunk_overlap
        );

        let kb_dir = self.kb_dir.clone();
        let documents = tokio::task::spawn_blocking(move || load_documents(&kb_dir))
            .await
            .map_err(|e| Error::KnowledgeBase(format!("Document loading task failed: {}", e)))??;

        let mut chunks = Vec::new();
        for doc in &documents {
            let pieces = chunk_text(&doc.text, chunk_size, chunk_overlap);
            if pieces.is_empty() {
                tracing::warn!("Skipping empty document {}", doc.name);
                continue;
            }
            tracing::debug!("{}: {} chunks", doc.name, pieces.len());
            for piece in pieces {
                chunks.push(Chunk::new(chunks.len() as u64, piece.text, doc.name.clone()));
            }
        }
        if chunks.is_empty() {
            return Err(Error::KnowledgeBase(format!(
                "no indexable markdown content in {}",
                self.kb_dir.display()
            )));
        }
        tracing::info!("Loaded {} documents, {} chunks", documents.len(), chunks.len());

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let (embedder, vectors, used_fallback) = self.embed_all(&texts).await?;
        let dimension = vectors.first().map(Vec::len).unwrap_or_default();

        let entries: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();
        let table = DocumentEmbeddingTable::from_chunks(embedder.model(), dimension, &entries)?;

        let manifest = IndexManifest {
            provider: embedder.provider_name().to_string(),
            model: embedder.model().to_string(),
            dimension,
            metric: DistanceMetric::SquaredEuclidean,
            chunk_size,
            chunk_overlap,
            documents: table.len(),
            chunks: entries.len(),
            built_at: Utc::now(),
        };
        let report = IndexReport {
            documents: manifest.documents,
            chunks: manifest.chunks,
            provider: manifest.provider.clone(),
            model: manifest.model.clone(),
            dimension,
            used_fallback,
            elapsed_ms: 0,
        };

        // Table before index; a failed index publish restores the old table.
        let previous_table = match self.doc_store.load().await {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!("Ignoring unreadable document table: {}", e);
                None
            }
        };
        self.doc_store.publish(table).await?;
        if let Err(e) = self.index.publish(manifest, entries).await {
            self.restore_table(previous_table).await;
            return Err(e);
        }

        let report = IndexReport {
            elapsed_ms: started.elapsed().as_millis() as u64,
            ..report
        };
        tracing::info!(
            "Indexing complete: {} documents, {} chunks with {} in {} ms",
            report.documents,
            report.chunks,
            report.model,
            report.elapsed_ms
        );
        Ok(report)
    }

    async fn restore_table(&self, previous: Option<Arc<DocumentEmbeddingTable>>) {
        let restored = match previous {
            Some(table) => self.doc_store.publish(table.as_ref().clone()).await,
            None => self.doc_store.clear().await,
        };
        if let Err(e) = restored {
            tracing::error!("Could not restore the previous document table: {}", e);
        }
    }

    /// Embeds the whole build with a single provider: the primary when it is
    /// usable, otherwise the fallback for every text.
    async fn embed_all(&self, texts: &[String]) -> Result<(Arc<Embedder>, Vec<Vec<f32>>, bool)> {
        let primary = self.embedders.primary();
        let fallback = self.embedders.fallback();

        if primary.is_available() {
            match primary.embed_batch(texts).await {
                Ok(vectors) => return Ok((primary.clone(), vectors, false)),
                Err(e @ Error::Provider { .. }) if fallback.is_some() => {
                    tracing::warn!(
                        "Primary provider {} failed ({}), re-embedding the build with the fallback",
                        primary.provider_name(),
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        } else {
            tracing::warn!("Primary provider {} is not available", primary.provider_name());
        }

        let fallback = fallback.ok_or_else(|| {
            Error::Config(format!(
                "embedding provider {} is not available and no fallback is configured",
                primary.provider_name()
            ))
        })?;
        if !fallback.is_available() {
            return Err(Error::Config(format!(
                "fallback provider {} ({}) is not available",
                fallback.provider_name(),
                fallback.model()
            )));
        }
        tracing::info!("Embedding with fallback model {}", fallback.model());
        let vectors = fallback.embed_batch(texts).await?;
        Ok((fallback.clone(), vectors, true))
    }
}
