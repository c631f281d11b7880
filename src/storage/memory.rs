//! In-memory key-value store

use dashmap::DashMap;
use futures::future::BoxFuture;

use super::{KeyValueStore, StorageError};

/// Process-local store backed by a concurrent map. State written here
/// does not survive a restart; it exists for tests and for crawls that
/// opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: DashMap<String, Vec<u8>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>> {
        Box::pin(async move { Ok(self.values.get(key).map(|entry| entry.value().clone())) })
    }

    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.values.insert(key.to_string(), value);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{get_json, set_json};

    #[tokio::test]
    async fn round_trips_bytes() {
        let store = MemoryKeyValueStore::new();
        assert!(store.get("missing").await.expect("get succeeds").is_none());

        store
            .set("key", b"value".to_vec())
            .await
            .expect("set succeeds");
        let value = store.get("key").await.expect("get succeeds");
        assert_eq!(value.as_deref(), Some(b"value".as_slice()));
    }

    #[tokio::test]
    async fn round_trips_json() {
        let store = MemoryKeyValueStore::new();
        set_json(&store, "nums", &vec![1u32, 2, 3])
            .await
            .expect("set succeeds");
        let back: Option<Vec<u32>> = get_json(&store, "nums").await.expect("get succeeds");
        assert_eq!(back, Some(vec![1, 2, 3]));
    }
}
