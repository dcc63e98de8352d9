use std::path::{Path, PathBuf};

use async_trait::async_trait;
use qdrant_client::qdrant::{
    CreateAliasBuilder, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{Chunk, IndexManifest, IndexedChunk};

const UPSERT_BATCH: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Chunk-level vector index. Publishing replaces the whole index at once:
/// readers see either the previous index or the new one, never a mix.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Manifest of the currently published index, if any.
    async fn manifest(&self) -> Result<Option<IndexManifest>>;

    async fn publish(&self, manifest: IndexManifest, entries: Vec<IndexedChunk>) -> Result<()>;

    /// Up to `k` nearest chunks, closest first, ties in insertion order.
    /// Fails with `IndexNotFound` when nothing has been published.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;
}

pub(crate) fn sort_hits(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.chunk.seq.cmp(&b.chunk.seq))
    });
}

pub(crate) fn check_entries(manifest: &IndexManifest, entries: &[IndexedChunk]) -> Result<()> {
    match entries
        .iter()
        .find(|e| e.embedding.len() != manifest.dimension)
    {
        Some(e) => Err(Error::DimensionMismatch {
            expected: manifest.dimension,
            actual: e.embedding.len(),
        }),
        None => Ok(()),
    }
}

/// Writes `bytes` next to `path` and renames over it.
pub(crate) async fn write_atomic(path: &Path, bytes: Vec<u8>) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Qdrant-backed index. Every build goes into a fresh collection
/// `<alias>_<uuid>`; publishing repoints the alias and drops the old
/// collection. The manifest is kept in a JSON file beside the data dir.
pub struct QdrantIndex {
    client: Qdrant,
    alias: String,
    manifest_path: PathBuf,
    swap: RwLock<()>,
}

impl QdrantIndex {
    pub async fn new(url: &str, alias: &str, manifest_path: impl Into<PathBuf>) -> Result<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = match Qdrant::from_url(url).build() {
            Ok(c) => {
                tracing::info!("Qdrant client built successfully");
                c
            }
            Err(e) => {
                tracing::error!("Qdrant client build failed: {:?}", e);
                return Err(Error::VectorStore(format!("Qdrant client build failed: {}", e)));
            }
        };

        Ok(Self {
            client,
            alias: alias.to_string(),
            manifest_path: manifest_path.into(),
            swap: RwLock::new(()),
        })
    }

    async fn aliased_collection(&self) -> Result<Option<String>> {
        let aliases = self.client.list_aliases().await?;
        Ok(aliases
            .aliases
            .into_iter()
            .find(|a| a.alias_name == self.alias)
            .map(|a| a.collection_name))
    }

    async fn fill_collection(
        &self,
        collection: &str,
        manifest: &IndexManifest,
        entries: Vec<IndexedChunk>,
    ) -> Result<()> {
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection).vectors_config(VectorParamsBuilder::new(
                    manifest.dimension as u64,
                    Distance::Euclid,
                )),
            )
            .await?;

        let points: Vec<PointStruct> = entries
            .into_iter()
            .map(|e| {
                let mut payload = JsonMap::new();
                payload.insert("chunk_id".to_string(), JsonValue::String(e.chunk.id));
                payload.insert("seq".to_string(), JsonValue::from(e.chunk.seq));
                payload.insert("text".to_string(), JsonValue::String(e.chunk.text));
                payload.insert("source".to_string(), JsonValue::String(e.chunk.source));
                PointStruct::new(e.chunk.seq, e.embedding, payload)
            })
            .collect();

        for batch in points.chunks(UPSERT_BATCH) {
            self.client
                .upsert_points(UpsertPointsBuilder::new(collection, batch.to_vec()).wait(true))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn manifest(&self) -> Result<Option<IndexManifest>> {
        let _guard = self.swap.read().await;
        if self.aliased_collection().await?.is_none() {
            return Ok(None);
        }
        match tokio::fs::read(&self.manifest_path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, manifest: IndexManifest, entries: Vec<IndexedChunk>) -> Result<()> {
        check_entries(&manifest, &entries)?;
        let collection = format!("{}_{}", self.alias, uuid::Uuid::new_v4().simple());
        tracing::info!("Building collection {} with {} points", collection, entries.len());

        if let Err(e) = self.fill_collection(&collection, &manifest, entries).await {
            tracing::error!("Building {} failed: {}", collection, e);
            if let Err(cleanup) = self.client.delete_collection(&collection).await {
                tracing::warn!("Failed to drop partial collection {}: {}", collection, cleanup);
            }
            return Err(e);
        }

        let previous = {
            let _guard = self.swap.write().await;
            let previous = self.aliased_collection().await?;
            if previous.is_some() {
                self.client.delete_alias(&self.alias).await?;
            }
            self.client
                .create_alias(CreateAliasBuilder::new(&collection, &self.alias))
                .await?;
            write_atomic(&self.manifest_path, serde_json::to_vec_pretty(&manifest)?).await?;
            previous
        };
        tracing::info!("Alias {} now points at {}", self.alias, collection);

        if let Some(old) = previous {
            if let Err(e) = self.client.delete_collection(&old).await {
                tracing::warn!("Failed to drop previous collection {}: {}", old, e);
            }
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let _guard = self.swap.read().await;
        if self.aliased_collection().await?.is_none() {
            return Err(Error::IndexNotFound);
        }

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.alias, query.to_vec(), k as u64).with_payload(true),
            )
            .await?;

        let mut hits = Vec::with_capacity(search_result.result.len());
        for point in search_result.result {
            let text = point.payload.get("text").and_then(|v| v.as_str());
            let source = point.payload.get("source").and_then(|v| v.as_str());
            let seq = point.payload.get("seq").and_then(|v| v.as_integer());
            if let (Some(text), Some(source), Some(seq)) = (text, source, seq) {
                // Qdrant reports plain Euclidean distance for `Distance::Euclid`.
                hits.push(ScoredChunk {
                    chunk: Chunk::new(seq as u64, text.to_string(), source.to_string()),
                    distance: point.score * point.score,
                });
            }
        }
        sort_hits(&mut hits);
        Ok(hits)
    }
}
