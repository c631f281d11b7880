//! Dynamic, persistent, deduplicated request queue
//!
//! The queue client layers delivery bookkeeping on top of a pluggable
//! backing store: a bounded cache of the queue head, the set of ids
//! currently delivered to workers, a recently-handled set that papers
//! over the store's read-after-write lag, and a unique-key cache that
//! makes repeated `add_request` calls cheap. Together they guarantee
//! that a unique key is delivered to at most one worker at a time and
//! successfully processed at most once, even on a backing store that is
//! only eventually consistent.

mod head;
mod memory;
mod storage;

pub use memory::InMemoryQueueStorage;
pub use storage::{QueueHead, QueueHeadItem, QueueInfo, QueueOperationInfo, RequestQueueStorage};

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::request::Request;
use crate::storage::StorageError;
use crate::utils::constants::{
    API_PROCESSED_REQUESTS_DELAY, MAX_CACHED_REQUESTS, MAX_QUERIES_FOR_CONSISTENCY,
    QUERY_HEAD_MIN_LENGTH, QUEUE_HEAD_LIMIT_GROWTH, RECENTLY_HANDLED_CACHE_SIZE,
    REQUEST_QUEUE_HEAD_MAX_LIMIT, STORAGE_CONSISTENCY_DELAY,
};

use head::OrderedKeySet;

/// Errors from request queue operations.
#[derive(Debug, thiserror::Error)]
pub enum RequestQueueError {
    /// `add_request` received a request that already carries a storage
    /// id; pass a freshly constructed request instead.
    #[error("request already has an id; add a freshly constructed request")]
    RequestAlreadyHasId,

    /// `mark_request_handled` or `reclaim_request` received a request
    /// that was never delivered by this queue.
    #[error("request has no id; it was not delivered by this queue")]
    MissingRequestId,

    /// The request is not currently delivered to a worker.
    #[error("request '{id}' is not being processed by this client")]
    NotInProgress { id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
struct CachedRequestInfo {
    id: String,
    is_handled: bool,
}

struct QueueState {
    /// Bounded ordered cache of ids believed to be at the front.
    queue_head: OrderedKeySet,
    /// Ids currently delivered to a worker.
    in_progress: HashSet<String>,
    /// Ids whose handled flag was just written; the store's head index
    /// may keep returning them for a while.
    recently_handled: LruCache<String, bool>,
    /// unique-key hash → id and handled flag.
    request_cache: LruCache<u64, CachedRequestInfo>,
    /// Counters maintained client-side. Trustworthy only while this is
    /// the queue's single client.
    assumed_total_count: u64,
    assumed_handled_count: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            queue_head: OrderedKeySet::new(),
            in_progress: HashSet::new(),
            recently_handled: LruCache::new(
                NonZeroUsize::new(RECENTLY_HANDLED_CACHE_SIZE).expect("cache size is non-zero"),
            ),
            request_cache: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_REQUESTS).expect("cache size is non-zero"),
            ),
            assumed_total_count: 0,
            assumed_handled_count: 0,
        }
    }
}

fn unique_key_hash(unique_key: &str) -> u64 {
    xxh3_64(unique_key.as_bytes())
}

/// Multi-consumer request queue with forefront insertion and
/// at-most-once successful delivery per unique key.
pub struct RequestQueue {
    storage: Arc<dyn RequestQueueStorage>,
    /// Shared with the delayed-release tasks spawned by `reclaim` and
    /// stale-head handling, which outlive the borrow of `&self`.
    state: Arc<Mutex<QueueState>>,
    /// Serializes head queries so concurrent consumers reuse one
    /// in-flight query instead of stampeding the store.
    head_lock: tokio::sync::Mutex<()>,
    consistency_delay: Duration,
    processed_delay: Duration,
    max_queries_for_consistency: u32,
}

impl RequestQueue {
    /// Queue over the built-in in-memory backing store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_storage(Arc::new(InMemoryQueueStorage::new()))
    }

    /// Queue over a caller-supplied backing store.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn RequestQueueStorage>) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(QueueState::new())),
            head_lock: tokio::sync::Mutex::new(()),
            consistency_delay: STORAGE_CONSISTENCY_DELAY,
            processed_delay: API_PROCESSED_REQUESTS_DELAY,
            max_queries_for_consistency: MAX_QUERIES_FOR_CONSISTENCY,
        }
    }

    /// Override the lag-compensation delays. The defaults are tuned for
    /// a remote store with seconds of replication lag; a local store
    /// can run much tighter.
    #[must_use]
    pub fn with_timings(mut self, consistency_delay: Duration, processed_delay: Duration) -> Self {
        self.consistency_delay = consistency_delay;
        self.processed_delay = processed_delay;
        self
    }

    /// Add a request unless its unique key is already known. A second
    /// add with the same unique key never mutates the stored request.
    pub async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, RequestQueueError> {
        if request.id().is_some() {
            return Err(RequestQueueError::RequestAlreadyHasId);
        }

        let cache_key = unique_key_hash(request.unique_key());
        {
            let mut state = self.state.lock();
            if let Some(cached) = state.request_cache.get(&cache_key) {
                return Ok(QueueOperationInfo {
                    request_id: cached.id.clone(),
                    was_already_present: true,
                    was_already_handled: cached.is_handled,
                });
            }
        }

        let info = self.storage.add_request(request, forefront).await?;

        let mut state = self.state.lock();
        state.request_cache.put(
            cache_key,
            CachedRequestInfo {
                id: info.request_id.clone(),
                is_handled: info.was_already_handled,
            },
        );

        if !info.was_already_present
            && !state.in_progress.contains(&info.request_id)
            && !state.recently_handled.contains(&info.request_id)
        {
            state.assumed_total_count += 1;
            if forefront {
                state.queue_head.push_front(info.request_id.clone());
            } else if state.assumed_total_count < QUERY_HEAD_MIN_LENGTH as u64 {
                state.queue_head.push_back(info.request_id.clone());
            }
        }

        Ok(info)
    }

    /// Deliver the next pending request, or `None` when nothing is
    /// available right now.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>, RequestQueueError> {
        self.ensure_head_is_non_empty(false, QUERY_HEAD_MIN_LENGTH)
            .await?;

        let next_id = {
            let mut state = self.state.lock();
            let id = state.queue_head.pop_front();
            if let Some(id) = &id {
                state.in_progress.insert(id.clone());
            }
            id
        };
        let Some(id) = next_id else {
            return Ok(None);
        };

        let request = match self.storage.get_request(&id).await {
            Ok(request) => request,
            Err(e) => {
                // Release the claim so the id can be delivered again.
                self.state.lock().in_progress.remove(&id);
                return Err(e.into());
            }
        };

        match request {
            // The head index was ahead of the store: the id will
            // resurface on a later head query once the write settles.
            None => {
                debug!("Queue head returned request '{id}' the store cannot find yet");
                self.delayed_release(id, None);
                Ok(None)
            }
            // The head index was behind the store: the request was
            // already handled, remember that and move on.
            Some(request) if request.is_handled() => {
                let mut state = self.state.lock();
                state.in_progress.remove(&id);
                state.recently_handled.put(id, true);
                Ok(None)
            }
            Some(request) => {
                let mut state = self.state.lock();
                state.request_cache.put(
                    unique_key_hash(request.unique_key()),
                    CachedRequestInfo {
                        id,
                        is_handled: false,
                    },
                );
                Ok(Some(request))
            }
        }
    }

    /// Resolve a delivered request as successfully processed.
    pub async fn mark_request_handled(
        &self,
        request: &mut Request,
    ) -> Result<QueueOperationInfo, RequestQueueError> {
        let id = request
            .id()
            .ok_or(RequestQueueError::MissingRequestId)?
            .to_string();
        if !self.state.lock().in_progress.contains(&id) {
            return Err(RequestQueueError::NotInProgress { id });
        }

        request.mark_handled_at(Utc::now());
        let info = self.storage.update_request(request.clone(), false).await?;

        let mut state = self.state.lock();
        state.in_progress.remove(&id);
        state.recently_handled.put(id.clone(), true);
        if !info.was_already_handled {
            state.assumed_handled_count += 1;
        }
        state.request_cache.put(
            unique_key_hash(request.unique_key()),
            CachedRequestInfo {
                id,
                is_handled: true,
            },
        );

        Ok(info)
    }

    /// Return a delivered request for redelivery, optionally at the
    /// front of the queue.
    pub async fn reclaim_request(
        &self,
        request: &Request,
        forefront: bool,
    ) -> Result<QueueOperationInfo, RequestQueueError> {
        let id = request
            .id()
            .ok_or(RequestQueueError::MissingRequestId)?
            .to_string();
        if !self.state.lock().in_progress.contains(&id) {
            return Err(RequestQueueError::NotInProgress { id });
        }

        let info = self
            .storage
            .update_request(request.clone(), forefront)
            .await?;

        // Keep the claim until the write settles, then make the id
        // deliverable again.
        self.delayed_release(id, Some(forefront));
        Ok(info)
    }

    /// True when no request is currently deliverable. In-progress
    /// requests do not count.
    pub async fn is_empty(&self) -> Result<bool, RequestQueueError> {
        self.ensure_head_is_non_empty(false, QUERY_HEAD_MIN_LENGTH)
            .await?;
        Ok(self.state.lock().queue_head.is_empty())
    }

    /// True when the queue is drained and every delivered request was
    /// resolved. May return a false negative against a lagging store;
    /// never a false positive.
    pub async fn is_finished(&self) -> Result<bool, RequestQueueError> {
        {
            let state = self.state.lock();
            if !state.queue_head.is_empty() || !state.in_progress.is_empty() {
                return Ok(false);
            }
        }

        let consistent = self
            .ensure_head_is_non_empty(true, QUERY_HEAD_MIN_LENGTH)
            .await?;
        let state = self.state.lock();
        Ok(consistent && state.queue_head.is_empty() && state.in_progress.is_empty())
    }

    /// Number of successfully handled requests, from the backing store.
    pub async fn handled_count(&self) -> Result<u64, RequestQueueError> {
        Ok(self.storage.get_info().await?.handled_request_count)
    }

    /// Total number of requests ever added, from the backing store.
    pub async fn total_count(&self) -> Result<u64, RequestQueueError> {
        Ok(self.storage.get_info().await?.total_request_count)
    }

    /// Number of requests currently delivered to workers.
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    /// Delete the queue and all stored requests.
    pub async fn drop_queue(&self) -> Result<(), RequestQueueError> {
        self.storage.delete_queue().await?;
        *self.state.lock() = QueueState::new();
        Ok(())
    }

    /// Fill the head cache from the backing store.
    ///
    /// In consistency mode the query is repeated — with growing limit
    /// and settle-time sleeps — until the store's answer can be
    /// trusted: either the last modification is older than the
    /// processing delay, or this client is provably the only writer and
    /// its own counters balance. Returns false when the budget of
    /// repeat queries runs out before consistency is reached.
    async fn ensure_head_is_non_empty(
        &self,
        ensure_consistency: bool,
        mut limit: usize,
    ) -> Result<bool, RequestQueueError> {
        if !self.state.lock().queue_head.is_empty() {
            return Ok(true);
        }

        // One query at a time; whoever was waiting profits from the
        // winner's result on re-check.
        let _guard = self.head_lock.lock().await;
        let mut iteration = 0u32;

        loop {
            if !self.state.lock().queue_head.is_empty() {
                return Ok(true);
            }

            let head = self.storage.get_head(limit).await?;
            let limit_reached = head.items.len() >= limit;

            let (head_is_empty, counters_balance) = {
                let mut state = self.state.lock();
                for item in &head.items {
                    if !state.in_progress.contains(&item.id)
                        && !state.recently_handled.contains(&item.id)
                    {
                        state.queue_head.push_back(item.id.clone());
                    }
                }
                (
                    state.queue_head.is_empty(),
                    state.assumed_total_count <= state.assumed_handled_count,
                )
            };

            let modified_age = (Utc::now() - head.queue_modified_at)
                .to_std()
                .unwrap_or_default();
            let is_database_consistent = modified_age >= self.processed_delay;
            let is_locally_consistent = !head.had_multiple_clients && counters_balance;

            let should_repeat_for_consistency =
                ensure_consistency && !is_database_consistent && !is_locally_consistent;
            let should_repeat_with_higher_limit =
                head_is_empty && limit_reached && limit < REQUEST_QUEUE_HEAD_MAX_LIMIT;

            if !should_repeat_for_consistency && !should_repeat_with_higher_limit {
                return Ok(true);
            }
            if should_repeat_for_consistency && iteration >= self.max_queries_for_consistency {
                warn!(
                    "Queue head did not reach consistency after {iteration} queries, giving up"
                );
                return Ok(false);
            }

            iteration += 1;
            if should_repeat_with_higher_limit {
                limit = ((limit as f64 * QUEUE_HEAD_LIMIT_GROWTH).ceil() as usize)
                    .min(REQUEST_QUEUE_HEAD_MAX_LIMIT);
            }
            if should_repeat_for_consistency {
                tokio::time::sleep(self.processed_delay).await;
            }
        }
    }

    /// Remove `id` from the in-progress set once the backing store has
    /// had time to settle, optionally making it deliverable again.
    fn delayed_release(&self, id: String, reinsert_forefront: Option<bool>) {
        let state = Arc::clone(&self.state);
        let delay = self.consistency_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = state.lock();
            state.in_progress.remove(&id);
            if let Some(forefront) = reinsert_forefront
                && !state.recently_handled.contains(&id)
            {
                if forefront {
                    state.queue_head.push_front(id);
                } else if state.queue_head.len() < QUERY_HEAD_MIN_LENGTH {
                    state.queue_head.push_back(id);
                }
            }
        });
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
