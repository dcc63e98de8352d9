use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::similarity::mean_vector;
use super::snapshot::SnapshotFile;
use crate::error::{Error, Result};
use crate::models::IndexedChunk;

/// One averaged vector per source document, tagged with the model that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEmbeddingTable {
    pub model: String,
    pub dimension: usize,
    pub documents: BTreeMap<String, Vec<f32>>,
}

impl DocumentEmbeddingTable {
    pub fn new(model: impl Into<String>, dimension: usize) -> Self {
        Self {
            model: model.into(),
            dimension,
            documents: BTreeMap::new(),
        }
    }

    /// Averages chunk embeddings per `source`.
    pub fn from_chunks(model: &str, dimension: usize, chunks: &[IndexedChunk]) -> Result<Self> {
        let mut by_doc: BTreeMap<&str, Vec<&[f32]>> = BTreeMap::new();
        for c in chunks {
            if c.embedding.len() != dimension {
                return Err(Error::DimensionMismatch {
                    expected: dimension,
                    actual: c.embedding.len(),
                });
            }
            by_doc
                .entry(c.chunk.source.as_str())
                .or_default()
                .push(c.embedding.as_slice());
        }

        let mut table = Self::new(model, dimension);
        for (doc, vectors) in by_doc {
            if let Some(mean) = mean_vector(vectors)? {
                table.documents.insert(doc.to_string(), mean);
            }
        }
        Ok(table)
    }

    pub fn insert(&mut self, doc: impl Into<String>, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.documents.insert(doc.into(), vector);
        Ok(())
    }

    pub fn get(&self, doc: &str) -> Option<&[f32]> {
        self.documents.get(doc).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

fn check_table(table: &DocumentEmbeddingTable) -> Result<()> {
    match table.documents.values().find(|v| v.len() != table.dimension) {
        Some(bad) => Err(Error::DimensionMismatch {
            expected: table.dimension,
            actual: bad.len(),
        }),
        None => Ok(()),
    }
}

/// Persists the table as a JSON file, replaced atomically on publish.
pub struct DocumentEmbeddingStore {
    file: SnapshotFile<DocumentEmbeddingTable>,
}

impl DocumentEmbeddingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: SnapshotFile::new(path.into()),
        }
    }

    pub async fn load(&self) -> Result<Option<Arc<DocumentEmbeddingTable>>> {
        self.file.load(check_table).await
    }

    pub async fn publish(&self, table: DocumentEmbeddingTable) -> Result<()> {
        let count = table.len();
        self.file.store(table).await?;
        tracing::info!(
            "Published {} document embeddings to {}",
            count,
            self.file.path().display()
        );
        Ok(())
    }

    /// Removes the published table.
    pub async fn clear(&self) -> Result<()> {
        self.file.remove().await?;
        tracing::info!("Removed document embeddings at {}", self.file.path().display());
        Ok(())
    }
}
