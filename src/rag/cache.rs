use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// On-disk record, one file per content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord {
    key: String,
    model: String,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub model: String,
    pub entries: usize,
    pub dir: PathBuf,
}

/// Content-addressed, write-once embedding cache for a single model.
///
/// Records live at `<root>/<model-slug>/<sha256(text)>.json` and are never
/// evicted. The key is the hash of the exact text: no whitespace or case
/// normalisation is applied.
pub struct EmbeddingCache {
    dir: PathBuf,
    model: String,
    dimension: Option<usize>,
    memory: RwLock<HashMap<String, Vec<f32>>>,
}

pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn model_slug(model: &str) -> String {
    model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

impl EmbeddingCache {
    pub async fn open(root: impl AsRef<Path>, model: &str, dimension: Option<usize>) -> Result<Self> {
        let dir = root.as_ref().join(model_slug(model));
        fs::create_dir_all(&dir).await?;
        tracing::debug!("Embedding cache for {} at {}", model, dir.display());
        Ok(Self {
            dir,
            model: model.to_string(),
            dimension,
            memory: RwLock::new(HashMap::new()),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != vector.len() => Err(Error::DimensionMismatch {
                expected,
                actual: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn get(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let key = cache_key(text);
        if let Some(v) = self.memory.read().await.get(&key) {
            return Ok(Some(v.clone()));
        }

        let path = self.record_path(&key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CacheRecord = serde_json::from_slice(&data)?;
        self.check_dimension(&record.vector)?;
        tracing::debug!("Cache hit: {}", key);

        self.memory
            .write()
            .await
            .insert(key, record.vector.clone());
        Ok(Some(record.vector))
    }

    /// Writes are idempotent: the record is staged in a temp file and renamed
    /// over any existing one, so concurrent writers of one key never leave a
    /// torn file behind.
    pub async fn put(&self, text: &str, vector: &[f32]) -> Result<()> {
        self.check_dimension(vector)?;
        let key = cache_key(text);
        let record = CacheRecord {
            key: key.clone(),
            model: self.model.clone(),
            vector: vector.to_vec(),
        };

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(&record)?).await?;
        fs::rename(&tmp, self.record_path(&key)).await?;

        self.memory.write().await.insert(key.clone(), record.vector);
        tracing::debug!("Saved embedding to cache: {}", key);
        Ok(())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.stats().await?.entries)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0usize;
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') && name.ends_with(".json") {
                entries += 1;
            }
        }
        Ok(CacheStats {
            model: self.model.clone(),
            entries,
            dir: self.dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_sha256_of_raw_text() {
        assert_eq!(
            cache_key("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_ne!(cache_key("hello"), cache_key("hello "));
        assert_ne!(cache_key("Hello"), cache_key("hello"));
    }

    #[tokio::test]
    async fn test_put_get_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(tmp.path(), "model-a", Some(2)).await.unwrap();
        assert!(cache.get("text").await.unwrap().is_none());

        cache.put("text", &[0.5, 0.25]).await.unwrap();
        assert_eq!(cache.get("text").await.unwrap(), Some(vec![0.5, 0.25]));

        let reopened = EmbeddingCache::open(tmp.path(), "model-a", Some(2)).await.unwrap();
        assert_eq!(reopened.get("text").await.unwrap(), Some(vec![0.5, 0.25]));
        assert_eq!(reopened.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_models_do_not_share_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let a = EmbeddingCache::open(tmp.path(), "model-a", None).await.unwrap();
        let b = EmbeddingCache::open(tmp.path(), "org/model-b", None).await.unwrap();
        a.put("text", &[1.0]).await.unwrap();
        assert!(b.get("text").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let loose = EmbeddingCache::open(tmp.path(), "m", None).await.unwrap();
        loose.put("text", &[1.0, 2.0, 3.0]).await.unwrap();

        let strict = EmbeddingCache::open(tmp.path(), "m", Some(2)).await.unwrap();
        assert!(matches!(
            strict.get("text").await,
            Err(Error::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(strict.put("other", &[1.0]).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_writes_of_same_key() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = std::sync::Arc::new(EmbeddingCache::open(tmp.path(), "m", None).await.unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.put("same", &[1.0, 2.0]).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(cache.get("same").await.unwrap(), Some(vec![1.0, 2.0]));
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }
}
