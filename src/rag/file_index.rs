use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::similarity::squared_euclidean;
use super::snapshot::SnapshotFile;
use super::vector_store::{check_entries, sort_hits, ScoredChunk, VectorIndex};
use crate::error::{Error, Result};
use crate::models::{IndexManifest, IndexedChunk};

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    manifest: IndexManifest,
    entries: Vec<IndexedChunk>,
}

/// Single-file index for local use: the snapshot is a JSON file replaced by
/// rename, and searched exhaustively in memory.
pub struct FileIndex {
    file: SnapshotFile<Snapshot>,
}

impl FileIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: SnapshotFile::new(path.into()),
        }
    }

    async fn snapshot(&self) -> Result<Option<Arc<Snapshot>>> {
        self.file
            .load(|s| check_entries(&s.manifest, &s.entries))
            .await
    }
}

#[async_trait]
impl VectorIndex for FileIndex {
    async fn manifest(&self) -> Result<Option<IndexManifest>> {
        Ok(self.snapshot().await?.map(|s| s.manifest.clone()))
    }

    async fn publish(&self, manifest: IndexManifest, entries: Vec<IndexedChunk>) -> Result<()> {
        check_entries(&manifest, &entries)?;
        let chunks = entries.len();
        self.file.store(Snapshot { manifest, entries }).await?;
        tracing::info!(
            "Published vector index to {} ({} chunks)",
            self.file.path().display(),
            chunks
        );
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let snapshot = self.snapshot().await?.ok_or(Error::IndexNotFound)?;
        if query.len() != snapshot.manifest.dimension {
            return Err(Error::DimensionMismatch {
                expected: snapshot.manifest.dimension,
                actual: query.len(),
            });
        }

        let mut hits = snapshot
            .entries
            .iter()
            .map(|e| {
                Ok(ScoredChunk {
                    chunk: e.chunk.clone(),
                    distance: squared_euclidean(query, &e.embedding)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DistanceMetric};

    fn manifest(dimension: usize, chunks: usize) -> IndexManifest {
        IndexManifest {
            provider: "test".into(),
            model: "test-model".into(),
            dimension,
            metric: DistanceMetric::SquaredEuclidean,
            chunk_size: 100,
            chunk_overlap: 10,
            documents: 1,
            chunks,
            built_at: chrono::Utc::now(),
        }
    }

    fn entry(seq: u64, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk: Chunk::new(seq, format!("text {}", seq), "doc.md".into()),
            embedding,
        }
    }

    #[tokio::test]
    async fn test_missing_index_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FileIndex::new(tmp.path().join("index.json"));
        assert!(index.manifest().await.unwrap().is_none());
        assert!(matches!(index.search(&[0.0], 1).await, Err(Error::IndexNotFound)));
    }

    #[tokio::test]
    async fn test_search_orders_by_distance_then_insertion() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FileIndex::new(tmp.path().join("index.json"));
        let entries = vec![
            entry(0, vec![3.0, 0.0]),
            entry(1, vec![0.0, 1.0]),
            entry(2, vec![1.0, 0.0]),
            entry(3, vec![0.5, 0.0]),
        ];
        index.publish(manifest(2, 4), entries).await.unwrap();

        let hits = index.search(&[0.0, 0.0], 3).await.unwrap();
        let seqs: Vec<u64> = hits.iter().map(|h| h.chunk.seq).collect();
        assert_eq!(seqs, vec![3, 1, 2]);
        assert_eq!(hits[0].distance, 0.25);
        assert!(hits.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[tokio::test]
    async fn test_publish_replaces_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        let index = FileIndex::new(&path);
        index.publish(manifest(2, 1), vec![entry(0, vec![1.0, 1.0])]).await.unwrap();
        index
            .publish(manifest(2, 2), vec![entry(0, vec![0.0, 0.0]), entry(1, vec![1.0, 0.0])])
            .await
            .unwrap();

        let reopened = FileIndex::new(&path);
        assert_eq!(reopened.manifest().await.unwrap().unwrap().chunks, 2);
        assert_eq!(reopened.search(&[0.0, 0.0], 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejects_mixed_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let index = FileIndex::new(tmp.path().join("index.json"));
        let err = index
            .publish(manifest(2, 2), vec![entry(0, vec![1.0, 1.0]), entry(1, vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 1 }));
        assert!(index.manifest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_index_sees_rebuild_from_another_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        let server = FileIndex::new(&path);
        let indexer = FileIndex::new(&path);

        indexer.publish(manifest(2, 1), vec![entry(0, vec![1.0, 0.0])]).await.unwrap();
        assert_eq!(server.search(&[0.0, 0.0], 10).await.unwrap().len(), 1);

        indexer
            .publish(manifest(2, 2), vec![entry(0, vec![1.0, 0.0]), entry(1, vec![0.0, 0.5])])
            .await
            .unwrap();
        assert_eq!(server.manifest().await.unwrap().unwrap().chunks, 2);
        let hits = server.search(&[0.0, 0.0], 10).await.unwrap();
        assert_eq!(hits[0].chunk.seq, 1);
    }
}
