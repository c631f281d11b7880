//! Directory-backed key-value store

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use log::debug;

use super::{KeyValueStore, StorageError};

/// Store that keeps each value as one file inside a directory.
///
/// Keys are restricted to the identifier-like names used for
/// checkpoints; anything that would escape the directory is rejected.
#[derive(Debug, Clone)]
pub struct FsKeyValueStore {
    dir: PathBuf,
}

impl FsKeyValueStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid || key.starts_with('.') {
            return Err(StorageError::Unavailable(format!(
                "invalid store key '{key}'"
            )));
        }
        Ok(self.dir.join(key))
    }
}

impl KeyValueStore for FsKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            // Write-then-rename so a crash mid-write never leaves a
            // truncated checkpoint behind.
            let tmp = path.with_extension("tmp");
            tokio::fs::write(&tmp, &value).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!("Persisted {} bytes under key '{key}'", value.len());
            Ok(())
        })
    }
}
