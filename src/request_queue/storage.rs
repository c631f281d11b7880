//! Backing store contract for the request queue
//!
//! The queue client in this crate compensates for a backing store that
//! is only eventually consistent: head queries may lag behind writes by
//! a bounded delay and may keep returning requests whose handled flag
//! was just written. Implementations therefore do not need to be
//! linearizable; they need to be complete (no request is ever lost) and
//! converge within the delays configured on the client.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::request::Request;
use crate::storage::StorageError;

/// Result of an add or update against the backing store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationInfo {
    /// Storage-assigned request id.
    pub request_id: String,
    /// The unique key was already present; the stored request was left
    /// untouched.
    pub was_already_present: bool,
    /// The stored request was already handled at the time of the call.
    pub was_already_handled: bool,
}

/// One entry of a head query result.
#[derive(Debug, Clone)]
pub struct QueueHeadItem {
    pub id: String,
    pub unique_key: String,
}

/// Result of a head query.
#[derive(Debug, Clone)]
pub struct QueueHead {
    /// Pending request ids in delivery order, best-effort.
    pub items: Vec<QueueHeadItem>,
    /// Instant of the last modification the store has processed.
    pub queue_modified_at: DateTime<Utc>,
    /// Whether any other client ever accessed this queue. When true,
    /// the client-side assumed counters cannot be trusted.
    pub had_multiple_clients: bool,
}

/// Aggregate counters of the queue.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub total_request_count: u64,
    pub handled_request_count: u64,
    pub pending_request_count: u64,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Persistent, deduplicated request storage behind a [`RequestQueue`].
///
/// [`RequestQueue`]: super::RequestQueue
pub trait RequestQueueStorage: Send + Sync {
    /// Insert a request unless its unique key is already present. The
    /// stored request is never mutated by a duplicate insert.
    fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<QueueOperationInfo, StorageError>>;

    /// Fetch a full request by id. `None` when the id is unknown (or
    /// not yet visible).
    fn get_request<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Request>, StorageError>>;

    /// Overwrite a stored request, repositioning it when it is pending.
    fn update_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<QueueOperationInfo, StorageError>>;

    /// Return up to `limit` pending requests from the front.
    fn get_head(&self, limit: usize) -> BoxFuture<'_, Result<QueueHead, StorageError>>;

    /// Aggregate counters.
    fn get_info(&self) -> BoxFuture<'_, Result<QueueInfo, StorageError>>;

    /// Drop the queue and all stored requests.
    fn delete_queue(&self) -> BoxFuture<'_, Result<(), StorageError>>;
}
