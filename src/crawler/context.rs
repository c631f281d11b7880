//! Crawling context handed to user handlers

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Weak;
use std::time::Duration;

use anyhow::Context as _;

use super::CrawlerInner;
use crate::request::Request;
use crate::request_queue::QueueOperationInfo;
use crate::session::SessionHandle;
use crate::statistics::StatisticsState;

/// Request slot shared between the crawler and the running handler.
///
/// The handler may mutate the allowed fields (headers, payload, user
/// data, `no_retry`) through the lock; the crawler reads the final
/// state back once the handler resolves.
pub type SharedRequest = Arc<tokio::sync::Mutex<Request>>;

/// Everything a user handler gets for one request attempt.
pub struct CrawlingContext {
    /// Attempt id, unique per invocation (not per request).
    pub id: String,
    /// The request being processed.
    pub request: SharedRequest,
    /// Session identity for this attempt, when a session pool is on.
    pub session: Option<SessionHandle>,
    /// Handle back to the crawler for pausing, aborting, or enqueueing
    /// follow-up requests.
    pub crawler: CrawlerHandle,
}

/// Non-owning handle from handler code back to the crawler.
///
/// The crawler owns the context map; the handle holds a weak reference,
/// so a handler outliving its crawl degrades into no-ops instead of
/// keeping the whole engine alive.
#[derive(Clone)]
pub struct CrawlerHandle {
    pub(super) inner: Weak<CrawlerInner>,
}

impl CrawlerHandle {
    /// Number of requests resolved (successfully or terminally failed)
    /// so far.
    #[must_use]
    pub fn handled_count(&self) -> u64 {
        self.inner
            .upgrade()
            .map_or(0, |inner| inner.handled_count.load(Ordering::SeqCst))
    }

    /// Snapshot of the crawl statistics.
    #[must_use]
    pub fn statistics(&self) -> Option<StatisticsState> {
        self.inner.upgrade().map(|inner| inner.statistics.state())
    }

    /// Pause the worker pool, waiting up to `timeout` for in-flight
    /// requests to finish.
    pub async fn pause(&self, timeout: Duration) -> anyhow::Result<()> {
        let inner = self.inner.upgrade().context("crawler is gone")?;
        let pool = inner.pool.get().context("crawler is not running")?;
        pool.pause(timeout).await?;
        Ok(())
    }

    /// Resume a paused worker pool.
    pub fn resume(&self) {
        if let Some(inner) = self.inner.upgrade()
            && let Some(pool) = inner.pool.get()
        {
            pool.resume();
        }
    }

    /// Abort the crawl. In-flight requests complete on their own.
    pub fn abort(&self) {
        if let Some(inner) = self.inner.upgrade()
            && let Some(pool) = inner.pool.get()
        {
            pool.abort();
        }
    }

    /// Enqueue a follow-up request. Requires a request queue.
    pub async fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> anyhow::Result<QueueOperationInfo> {
        let inner = self.inner.upgrade().context("crawler is gone")?;
        let queue = inner
            .request_queue
            .as_ref()
            .context("crawler has no request queue")?;
        let info = queue.add_request(request, forefront).await?;
        Ok(info)
    }
}
