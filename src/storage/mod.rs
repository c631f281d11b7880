//! Key-value persistence abstraction for checkpoints
//!
//! The request list, the statistics collector, and anything else that
//! wants to survive a process restart writes its state through this
//! store. Implementations are deliberately tiny: `get` and `set` on
//! byte values. Two ship with the crate — an in-memory store for tests
//! and short-lived crawls, and a directory-backed store for local runs.

mod fs;
mod memory;

pub use fs::FsKeyValueStore;
pub use memory::MemoryKeyValueStore;

use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Store key for the request list's resumption checkpoint.
pub const REQUEST_LIST_STATE_KEY: &str = "REQUEST_LIST_STATE";

/// Store key for the request list's fetched source snapshot.
pub const REQUEST_LIST_REQUESTS_KEY: &str = "REQUEST_LIST_REQUESTS";

/// Store key for the statistics snapshot.
pub const STATISTICS_STATE_KEY: &str = "STATISTICS_STATE";

/// Errors from key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached or refused the operation.
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem-level failure from a directory-backed store.
    #[error("storage I/O failed")]
    Io(#[from] std::io::Error),
}

/// Byte-oriented key-value store used for all checkpoints.
///
/// Implementors only need `get` and `set`; values are opaque bytes and
/// keys are short identifiers such as [`REQUEST_LIST_STATE_KEY`].
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StorageError>>;

    /// Write `value` under `key`, replacing any previous value.
    fn set<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<(), StorageError>>;
}

/// Read and JSON-decode a value from `store`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// JSON-encode and write a value to `store`.
pub async fn set_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes).await
}
