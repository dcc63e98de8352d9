use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use super::vector_store::write_atomic;
use crate::error::Result;

/// What a reader last saw of the file. Publishing renames a new file into
/// place, so a rebuild from another process changes at least one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

async fn file_stamp(path: &Path) -> Result<Option<FileStamp>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// A JSON file mirrored in memory. Every read checks the file on disk and
/// reloads when it was replaced, so a running server follows builds made by
/// `rag-indexer`.
pub(crate) struct SnapshotFile<T> {
    path: PathBuf,
    current: RwLock<Option<(FileStamp, Arc<T>)>>,
}

impl<T> SnapshotFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: RwLock::new(None),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents, `None` when the file does not exist. `check` runs
    /// on every freshly loaded value before it is served.
    pub(crate) async fn load(&self, check: fn(&T) -> Result<()>) -> Result<Option<Arc<T>>> {
        let Some(stamp) = file_stamp(&self.path).await? else {
            *self.current.write().await = None;
            return Ok(None);
        };
        if let Some((seen, value)) = self.current.read().await.as_ref() {
            if *seen == stamp {
                return Ok(Some(value.clone()));
            }
        }

        let mut current = self.current.write().await;
        if let Some((seen, value)) = current.as_ref() {
            if *seen == stamp {
                return Ok(Some(value.clone()));
            }
        }
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *current = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let value: T = serde_json::from_slice(&data)?;
        check(&value)?;
        let value = Arc::new(value);
        *current = Some((stamp, value.clone()));
        tracing::info!("Loaded {}", self.path.display());
        Ok(Some(value))
    }

    /// Atomically replaces the file and the in-memory copy.
    pub(crate) async fn store(&self, value: T) -> Result<()> {
        let mut current = self.current.write().await;
        write_atomic(&self.path, serde_json::to_vec(&value)?).await?;
        *current = file_stamp(&self.path)
            .await?
            .map(|stamp| (stamp, Arc::new(value)));
        Ok(())
    }

    pub(crate) async fn remove(&self) -> Result<()> {
        let mut current = self.current.write().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *current = None;
        Ok(())
    }
}
