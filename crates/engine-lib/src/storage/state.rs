//! Per-detector key/value state handed to detector modules

use super::fs::write_atomic;
use crate::presentation::sha256_hex;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Ceiling for a single stored value (1 GiB)
pub const MAX_STATE_VALUE_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StateError {
    /// Value exceeds the size ceiling; retrying cannot succeed
    #[error("state value of {size} bytes exceeds the {limit} byte limit")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("invalid state key: {0}")]
    InvalidKey(String),

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StateError::Io(_))
    }
}

/// Opaque byte store scoped to one detector
#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StateError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;

    async fn delete(&self, key: &str) -> Result<(), StateError>;
}

/// Typed JSON helpers over [`StateRepository`]
#[async_trait]
pub trait StateRepositoryExt {
    async fn store_json<T>(&self, key: &str, value: &T) -> Result<(), StateError>
    where
        T: Serialize + Sync;

    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StateError>
    where
        T: DeserializeOwned;
}

#[async_trait]
impl<S> StateRepositoryExt for S
where
    S: StateRepository + ?Sized,
{
    async fn store_json<T>(&self, key: &str, value: &T) -> Result<(), StateError>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)?;
        self.store(key, bytes).await
    }

    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StateError>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Hands out the state repository of a detector
pub trait StateRepositoryFactory: Send + Sync {
    fn for_detector(&self, detector_id: &str) -> Arc<dyn StateRepository>;
}

pub(crate) fn check_size(len: usize, limit: usize) -> Result<(), StateError> {
    if len > limit {
        return Err(StateError::ValueTooLarge { size: len, limit });
    }
    Ok(())
}

pub(crate) fn check_key(key: &str) -> Result<(), StateError> {
    if key.is_empty() {
        return Err(StateError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(())
}

/// State stored as one file per key under `<root>/<detector id>/`
pub struct FileStateRepository {
    dir: PathBuf,
    limit: usize,
}

impl FileStateRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_limit(dir, MAX_STATE_VALUE_BYTES)
    }

    pub fn with_limit(dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            dir: dir.into(),
            limit,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are arbitrary strings; hash them into safe file names
        self.dir.join(sha256_hex(key))
    }
}

#[async_trait]
impl StateRepository for FileStateRepository {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StateError> {
        check_key(key)?;
        check_size(value.len(), self.limit)?;

        write_atomic(&self.path_for(key), &value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        check_key(key)?;
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        check_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Creates [`FileStateRepository`]s below a root directory
pub struct FileStateRepositoryFactory {
    root: PathBuf,
    limit: usize,
}

impl FileStateRepositoryFactory {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            limit: MAX_STATE_VALUE_BYTES,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

impl StateRepositoryFactory for FileStateRepositoryFactory {
    fn for_detector(&self, detector_id: &str) -> Arc<dyn StateRepository> {
        let dir = self.root.join(sha256_hex(detector_id));
        Arc::new(FileStateRepository::with_limit(dir, self.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Baseline {
        mean: f64,
        samples: u32,
    }

    #[tokio::test]
    async fn test_store_get_delete() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());

        assert!(repo.get("baseline").await.unwrap().is_none());

        let baseline = Baseline {
            mean: 41.5,
            samples: 12,
        };
        repo.store_json("baseline", &baseline).await.unwrap();
        let loaded: Option<Baseline> = repo.get_json("baseline").await.unwrap();
        assert_eq!(loaded, Some(baseline));

        repo.delete("baseline").await.unwrap();
        assert!(repo.get("baseline").await.unwrap().is_none());

        // Deleting a missing key is not an error
        repo.delete("baseline").await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_value_is_not_retriable() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::with_limit(dir.path(), 8);

        let err = repo.store("k", vec![0u8; 9]).await.unwrap_err();
        assert!(matches!(err, StateError::ValueTooLarge { size: 9, limit: 8 }));
        assert!(!err.is_retriable());

        repo.store("k", vec![0u8; 8]).await.unwrap();
    }

    #[tokio::test]
    async fn test_factory_isolates_detectors() {
        let dir = TempDir::new().unwrap();
        let factory = FileStateRepositoryFactory::new(dir.path());

        let a = factory.for_detector("a");
        let b = factory.for_detector("b");
        a.store("shared-key", b"from-a".to_vec()).await.unwrap();

        assert!(b.get("shared-key").await.unwrap().is_none());
        assert_eq!(a.get("shared-key").await.unwrap().unwrap(), b"from-a");
    }

    #[tokio::test]
    async fn test_concurrent_stores_to_one_key_last_writer_wins() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(FileStateRepository::new(dir.path()));

        let mut writers = tokio::task::JoinSet::new();
        for breaches in 0u32..64 {
            let repo = repo.clone();
            writers.spawn(async move { repo.store_json("breaches:vm1", &breaches).await });
        }
        while let Some(result) = writers.join_next().await {
            result.unwrap().unwrap();
        }

        // Whichever writer renamed last, the value is one complete write
        let stored: Option<u32> = repo.get_json("breaches:vm1").await.unwrap();
        assert!(stored.is_some_and(|v| v < 64));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        assert!(matches!(
            repo.store("", Vec::new()).await,
            Err(StateError::InvalidKey(_))
        ));
    }
}
