//! In-memory queue backing store

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use uuid::Uuid;

use super::storage::{QueueHead, QueueHeadItem, QueueInfo, QueueOperationInfo, RequestQueueStorage};
use crate::request::Request;
use crate::storage::StorageError;

#[derive(Default)]
struct StoreInner {
    /// id → stored request.
    requests: HashMap<String, Request>,
    /// unique key → id.
    by_unique_key: HashMap<String, String>,
    /// Pending ids in delivery order. Handled ids are removed.
    pending_order: VecDeque<String>,
    handled_count: u64,
    modified_at: Option<DateTime<Utc>>,
}

/// Process-local backing store. Fully consistent and single-client, so
/// the queue's lag-compensation paths are never exercised against it —
/// which is exactly what makes it useful for tests and for crawls that
/// do not need durability.
#[derive(Default)]
pub struct InMemoryQueueStorage {
    inner: Mutex<StoreInner>,
}

impl InMemoryQueueStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RequestQueueStorage for InMemoryQueueStorage {
    fn add_request(
        &self,
        mut request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<QueueOperationInfo, StorageError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();

            if let Some(id) = inner.by_unique_key.get(request.unique_key()).cloned() {
                let stored = inner.requests.get(&id).ok_or_else(|| {
                    StorageError::Unavailable(format!("request '{id}' indexed but missing"))
                })?;
                return Ok(QueueOperationInfo {
                    request_id: id,
                    was_already_present: true,
                    was_already_handled: stored.is_handled(),
                });
            }

            let id = Uuid::new_v4().simple().to_string();
            request.set_id(id.clone());
            let was_already_handled = request.is_handled();

            inner
                .by_unique_key
                .insert(request.unique_key().to_string(), id.clone());
            inner.requests.insert(id.clone(), request);
            if !was_already_handled {
                if forefront {
                    inner.pending_order.push_front(id.clone());
                } else {
                    inner.pending_order.push_back(id.clone());
                }
            } else {
                inner.handled_count += 1;
            }
            inner.modified_at = Some(Utc::now());

            Ok(QueueOperationInfo {
                request_id: id,
                was_already_present: false,
                was_already_handled,
            })
        })
    }

    fn get_request<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Request>, StorageError>> {
        Box::pin(async move { Ok(self.inner.lock().requests.get(id).cloned()) })
    }

    fn update_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<QueueOperationInfo, StorageError>> {
        Box::pin(async move {
            let id = request
                .id()
                .ok_or_else(|| {
                    StorageError::Unavailable("cannot update a request without an id".to_string())
                })?
                .to_string();

            let mut inner = self.inner.lock();
            let was_handled_before = inner
                .requests
                .get(&id)
                .ok_or_else(|| StorageError::Unavailable(format!("request '{id}' not found")))?
                .is_handled();
            let is_handled_now = request.is_handled();

            inner.requests.insert(id.clone(), request);
            inner.modified_at = Some(Utc::now());

            match (was_handled_before, is_handled_now) {
                (false, true) => {
                    inner.pending_order.retain(|pending| pending != &id);
                    inner.handled_count += 1;
                }
                (false, false) => {
                    // Reclaim: reposition among the pending ids.
                    inner.pending_order.retain(|pending| pending != &id);
                    if forefront {
                        inner.pending_order.push_front(id.clone());
                    } else {
                        inner.pending_order.push_back(id.clone());
                    }
                }
                // A handled request stays handled.
                (true, _) => {}
            }

            Ok(QueueOperationInfo {
                request_id: id,
                was_already_present: true,
                was_already_handled: was_handled_before,
            })
        })
    }

    fn get_head(&self, limit: usize) -> BoxFuture<'_, Result<QueueHead, StorageError>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            let items = inner
                .pending_order
                .iter()
                .take(limit)
                .filter_map(|id| {
                    inner.requests.get(id).map(|request| QueueHeadItem {
                        id: id.clone(),
                        unique_key: request.unique_key().to_string(),
                    })
                })
                .collect();
            Ok(QueueHead {
                items,
                queue_modified_at: inner.modified_at.unwrap_or_else(Utc::now),
                had_multiple_clients: false,
            })
        })
    }

    fn get_info(&self) -> BoxFuture<'_, Result<QueueInfo, StorageError>> {
        Box::pin(async move {
            let inner = self.inner.lock();
            Ok(QueueInfo {
                total_request_count: inner.requests.len() as u64,
                handled_request_count: inner.handled_count,
                pending_request_count: inner.pending_order.len() as u64,
                queue_modified_at: inner.modified_at.unwrap_or_else(Utc::now),
                had_multiple_clients: false,
            })
        })
    }

    fn delete_queue(&self) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            *self.inner.lock() = StoreInner::default();
            Ok(())
        })
    }
}
