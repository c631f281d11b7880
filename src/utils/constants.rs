//! Shared configuration constants for crawlkit
//!
//! This module contains default values and tuning constants used
//! throughout the codebase to ensure consistency and avoid magic numbers.

use std::time::Duration;

/// Minimum number of request ids fetched per queue-head query.
///
/// Head queries below this size are cheap; the limit grows by
/// [`QUEUE_HEAD_LIMIT_GROWTH`] whenever a full page comes back while the
/// local head cache is still empty (everything returned was in progress
/// or recently handled).
pub const QUERY_HEAD_MIN_LENGTH: usize = 100;

/// Hard ceiling for a single queue-head query.
pub const REQUEST_QUEUE_HEAD_MAX_LIMIT: usize = 1000;

/// Growth factor applied to the head-query limit on a repeat query.
pub const QUEUE_HEAD_LIMIT_GROWTH: f64 = 1.5;

/// How long the backing store may keep returning stale handled/pending
/// flags after a write. Used by the queue's finished-detection loop:
/// a head snapshot older than this is trusted as consistent.
pub const API_PROCESSED_REQUESTS_DELAY: Duration = Duration::from_secs(10);

/// Settle time for a single write against the backing store.
///
/// After `reclaim` or a stale head entry, the id is kept in the
/// in-progress set for this long so the next head query does not hand
/// the same request to another worker before the write is visible.
pub const STORAGE_CONSISTENCY_DELAY: Duration = Duration::from_secs(3);

/// Maximum number of repeated head queries when confirming the queue is
/// truly finished. Giving up yields a false negative, never a false
/// positive.
pub const MAX_QUERIES_FOR_CONSISTENCY: u32 = 6;

/// Capacity of the unique-key → id cache on the queue client. The
/// cache preallocates, so this bounds per-queue memory up front.
pub const MAX_CACHED_REQUESTS: usize = 100_000;

/// Capacity of the recently-handled id set, compensating for
/// read-after-write lag of the backing store's head index.
pub const RECENTLY_HANDLED_CACHE_SIZE: usize = 1000;

/// Default time budget for draining in-flight tasks when the host
/// signals migration or abort.
pub const DEFAULT_SAFE_MIGRATION_WAIT: Duration = Duration::from_secs(20);

/// Default timeout for internal source operations (fetch next request,
/// mark handled, reclaim).
pub const DEFAULT_INTERNAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget for internal source operations that time out.
pub const DEFAULT_INTERNAL_TIMEOUT_RETRIES: u32 = 3;

/// Default timeout for a single user-handler invocation.
pub const DEFAULT_HANDLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of retries for a request whose handler failed.
pub const DEFAULT_MAX_REQUEST_RETRIES: u32 = 3;
