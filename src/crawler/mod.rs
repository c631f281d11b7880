//! The per-request state machine wired into the worker pool
//!
//! `BasicCrawler` glues everything together: it pulls the next request
//! from its sources (a static list, a dynamic queue, or both), invokes
//! the user handler under a time limit, and resolves each attempt as
//! success, retry, or terminal failure. Source operations run under a
//! timeout-and-retry wrapper so a transient backing-store hiccup costs
//! one attempt, not the crawl. The handler itself is wrapped in a plain
//! timeout — a handler timeout is a failed attempt and goes through the
//! ordinary retry path.

mod context;
mod options;

pub use context::{CrawlerHandle, CrawlingContext, SharedRequest};
pub use options::BasicCrawlerBuilder;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::events::{EventBus, SystemEvent};
use crate::load_monitor::LoadMonitor;
use crate::pool::{AutoscaledPool, AutoscaledPoolOptions, PoolError, PoolQueryFn, RunTaskFn};
use crate::request::Request;
use crate::request_list::{RequestList, RequestListError};
use crate::request_queue::{RequestQueue, RequestQueueError};
use crate::session::{SessionHandle, SessionPool};
use crate::statistics::{Statistics, StatisticsState};
use crate::storage::StorageError;
use crate::utils::timeout::{timeout_and_retry, with_timeout};

/// Errors from building or running a crawler.
#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("invalid crawler configuration: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    RequestList(#[from] RequestListError),

    #[error(transparent)]
    RequestQueue(#[from] RequestQueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-request user handler.
///
/// Implemented automatically by async closures:
///
/// ```rust,ignore
/// let crawler = BasicCrawler::builder()
///     .request_list(list)
///     .handle_request_function(|ctx: CrawlingContext| async move {
///         let url = ctx.request.lock().await.url().to_string();
///         // fetch and process `url` ...
///         Ok(())
///     })
///     .build()?;
/// ```
///
/// A handler signals failure by returning an error; the crawler then
/// drives the retry state machine. Handlers may mutate the request's
/// headers, payload, user data, and `no_retry` flag through the shared
/// slot, but never its URL or unique key (those have no public
/// setters).
pub trait RequestHandler: Send + Sync {
    fn handle(&self, context: CrawlingContext) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(CrawlingContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(&self, context: CrawlingContext) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(context))
    }
}

/// Handler invoked once per request after retries are exhausted.
pub trait FailedRequestHandler: Send + Sync {
    fn handle(
        &self,
        context: CrawlingContext,
        error: anyhow::Error,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> FailedRequestHandler for F
where
    F: Fn(CrawlingContext, anyhow::Error) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handle(
        &self,
        context: CrawlingContext,
        error: anyhow::Error,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(context, error))
    }
}

pub(crate) struct CrawlerInner {
    request_list: Option<Arc<RequestList>>,
    request_queue: Option<Arc<RequestQueue>>,
    handler: Arc<dyn RequestHandler>,
    failed_handler: Option<Arc<dyn FailedRequestHandler>>,
    statistics: Arc<Statistics>,
    session_pool: Option<Arc<SessionPool>>,
    event_bus: Option<Arc<EventBus>>,
    load_monitor: Arc<LoadMonitor>,
    pool: OnceCell<Arc<AutoscaledPool>>,
    pool_options: AutoscaledPoolOptions,
    handled_count: AtomicU64,
    handle_request_timeout: Duration,
    max_request_retries: u32,
    max_requests_per_crawl: Option<u64>,
    internal_timeout: Duration,
    internal_retries: u32,
    safe_migration_wait: Duration,
}

/// Generic crawler: fetch, handle, resolve — with bounded concurrency
/// adaptive to system load.
pub struct BasicCrawler {
    inner: Arc<CrawlerInner>,
}

impl BasicCrawler {
    #[must_use]
    pub fn builder() -> BasicCrawlerBuilder {
        BasicCrawlerBuilder::default()
    }

    /// Run the crawl to completion.
    ///
    /// Resolves once every request from the sources was processed (or
    /// the `max_requests_per_crawl` ceiling was hit and in-flight work
    /// drained), or surfaces the first fatal error. Final statistics
    /// are logged in both cases.
    pub async fn run(&self) -> Result<(), CrawlerError> {
        let inner = &self.inner;

        if let Some(list) = &inner.request_list {
            list.initialize().await?;
        }
        inner.statistics.initialize().await?;
        inner.statistics.start_periodic_persist();
        inner.load_monitor.start();

        let pool = inner
            .pool
            .get_or_try_init(|| self.build_pool())?
            .clone();

        let event_task = inner.event_bus.as_ref().map(|bus| {
            let mut receiver = bus.subscribe();
            let weak = Arc::downgrade(inner);
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => {
                            let Some(inner) = weak.upgrade() else { break };
                            match event {
                                SystemEvent::Migrating | SystemEvent::Aborting => {
                                    inner.handle_migration(event).await;
                                }
                                SystemEvent::PersistState => inner.persist_state().await,
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Event subscription lagged, missed {missed} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        });

        let run_result = pool.run().await;

        if let Some(task) = event_task {
            task.abort();
        }
        inner.load_monitor.stop();
        inner.statistics.stop_periodic_persist();
        inner.persist_state().await;
        inner.statistics.log_summary();

        run_result.map_err(CrawlerError::Pool)
    }

    fn build_pool(&self) -> Result<Arc<AutoscaledPool>, PoolError> {
        let weak = Arc::downgrade(&self.inner);

        let run_task: RunTaskFn = {
            let weak = weak.clone();
            Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.run_task_function().await,
                        None => Ok(()),
                    }
                })
            })
        };
        let is_task_ready: PoolQueryFn = {
            let weak = weak.clone();
            Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.is_task_ready().await,
                        None => Ok(false),
                    }
                })
            })
        };
        let is_finished: PoolQueryFn = Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => inner.is_finished().await,
                    None => Ok(true),
                }
            })
        });

        Ok(Arc::new(AutoscaledPool::new(
            self.inner.pool_options.clone(),
            run_task,
            is_task_ready,
            is_finished,
        )?))
    }

    /// Number of requests resolved so far.
    #[must_use]
    pub fn handled_count(&self) -> u64 {
        self.inner.handled_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the crawl statistics.
    #[must_use]
    pub fn statistics(&self) -> StatisticsState {
        self.inner.statistics.state()
    }

    /// Handle usable from outside `run()`, e.g. for tests or embedders
    /// that want to pause or abort the crawl.
    #[must_use]
    pub fn handle(&self) -> CrawlerHandle {
        CrawlerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Seed the request queue, typically before `run()`. Requires a
    /// request queue to be configured.
    pub async fn add_requests(
        &self,
        requests: impl IntoIterator<Item = Request>,
    ) -> Result<(), CrawlerError> {
        let queue = self.inner.request_queue.as_ref().ok_or_else(|| {
            CrawlerError::InvalidOptions("add_requests needs a request queue".to_string())
        })?;
        for request in requests {
            queue.add_request(request, false).await?;
        }
        Ok(())
    }
}

impl CrawlerInner {
    /// One pool task: one request attempt from fetch to resolution.
    async fn run_task_function(self: Arc<Self>) -> anyhow::Result<()> {
        let fetched = {
            let this = Arc::clone(&self);
            timeout_and_retry(
                "fetch next request",
                self.internal_timeout,
                self.internal_retries,
                move || {
                    let this = Arc::clone(&this);
                    async move { this.fetch_next_request().await }
                },
            )
            .await?
        };
        let Some(mut request) = fetched else {
            return Ok(());
        };

        let session = self.session_pool.as_ref().map(|pool| pool.session());
        request.clear_loaded_url();

        let attempt_id = Uuid::new_v4().simple().to_string();
        self.statistics.start_job(&attempt_id);
        debug!(
            "Processing request {} (attempt {}, retry {})",
            request.url(),
            attempt_id,
            request.retry_count()
        );

        let shared: SharedRequest = Arc::new(tokio::sync::Mutex::new(request));
        let crawling_context = CrawlingContext {
            id: attempt_id.clone(),
            request: Arc::clone(&shared),
            session: session.clone(),
            crawler: CrawlerHandle {
                inner: Arc::downgrade(&self),
            },
        };

        // Plain timeout, no retry: a handler timeout is an attempt
        // failure. Dropping the future cancels the handler at its next
        // suspension point; the crawler does not wait beyond that.
        let handler_result = with_timeout(
            "user request handler",
            self.handle_request_timeout,
            self.handler.handle(crawling_context),
        )
        .await;

        // The handler may have cloned the slot into a spawned task; fall
        // back to a snapshot if it is still shared.
        let request = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner(),
            Err(arc) => arc.lock().await.clone(),
        };

        match handler_result {
            Ok(()) => Self::resolve_success(&self, request, session, &attempt_id).await,
            Err(error) => Self::resolve_failure(&self, request, session, &attempt_id, error).await,
        }
    }

    async fn resolve_success(
        this: &Arc<Self>,
        mut request: Request,
        session: Option<SessionHandle>,
        attempt_id: &str,
    ) -> anyhow::Result<()> {
        match this.mark_handled_with_retry(&mut request).await {
            Ok(()) => {
                if let Some(session) = session {
                    session.mark_good();
                }
                this.handled_count.fetch_add(1, Ordering::SeqCst);
                this.statistics.finish_job(attempt_id, request.retry_count());
                debug!("Request {} handled successfully", request.url());
                Ok(())
            }
            // The handler succeeded but the source write did not; the
            // attempt is resolved like a handler failure so the request
            // is not lost.
            Err(error) => Self::resolve_failure(this, request, session, attempt_id, error).await,
        }
    }

    /// Failure resolution: retry or terminally fail. Any error inside
    /// this path is fatal and aborts the crawl.
    async fn resolve_failure(
        this: &Arc<Self>,
        mut request: Request,
        session: Option<SessionHandle>,
        attempt_id: &str,
        error: anyhow::Error,
    ) -> anyhow::Result<()> {
        request.push_error_message(&error);
        if let Some(session) = &session {
            session.mark_bad();
        }

        let will_retry = !request.no_retry && request.retry_count() < this.max_request_retries;
        if will_retry {
            request.bump_retry_count();
            info!(
                "Retrying request {} ({}/{}): {error:#}",
                request.url(),
                request.retry_count(),
                this.max_request_retries
            );
            this.reclaim_with_retry(&request)
                .await
                .map_err(|e| e.context("failed to reclaim request for retry"))?;
            return Ok(());
        }

        this.mark_handled_with_retry(&mut request)
            .await
            .map_err(|e| e.context("failed to resolve request as terminally failed"))?;
        this.handled_count.fetch_add(1, Ordering::SeqCst);
        this.statistics.fail_job(attempt_id, request.retry_count());

        if let Some(failed_handler) = &this.failed_handler {
            let context = CrawlingContext {
                id: attempt_id.to_string(),
                request: Arc::new(tokio::sync::Mutex::new(request)),
                session,
                crawler: CrawlerHandle {
                    inner: Arc::downgrade(this),
                },
            };
            if let Err(e) = failed_handler.handle(context, error).await {
                error!("handle_failed_request_function threw: {e:#}");
            }
        } else {
            error!(
                "Request {} failed after {} retries: {error:#}",
                request.url(),
                request.retry_count()
            );
        }
        Ok(())
    }

    /// Fetch the next request across both sources.
    ///
    /// With both configured, the list feeds the queue: a fresh list
    /// request is inserted at the queue's forefront and marked handled
    /// in the list, making the queue the single authoritative source
    /// once the list drains.
    async fn fetch_next_request(&self) -> anyhow::Result<Option<Request>> {
        let Some(list) = &self.request_list else {
            return match &self.request_queue {
                Some(queue) => Ok(queue.fetch_next_request().await?),
                None => Ok(None),
            };
        };

        let request = list.fetch_next_request().await?;
        let Some(queue) = &self.request_queue else {
            return Ok(request);
        };
        let Some(request) = request else {
            return Ok(queue.fetch_next_request().await?);
        };

        if let Err(e) = queue.add_request(request.clone(), true).await {
            warn!(
                "Could not transfer request {} to the queue, reclaiming to the list: {e}",
                request.url()
            );
            list.reclaim_request(&request).await?;
            return Ok(None);
        }
        list.mark_request_handled(&request).await?;
        Ok(queue.fetch_next_request().await?)
    }

    /// Mark a request handled on whichever source delivered it. Routed
    /// by id: queue deliveries carry one, list deliveries do not.
    async fn mark_handled_with_retry(&self, request: &mut Request) -> anyhow::Result<()> {
        request.mark_handled_at(Utc::now());
        let snapshot = request.clone();

        if snapshot.id().is_some() {
            let queue = self
                .request_queue
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("request carries an id but no queue is configured"))?;
            let queue = Arc::clone(queue);
            timeout_and_retry(
                "mark request handled",
                self.internal_timeout,
                self.internal_retries,
                move || {
                    let queue = Arc::clone(&queue);
                    let mut request = snapshot.clone();
                    async move {
                        queue.mark_request_handled(&mut request).await?;
                        Ok(())
                    }
                },
            )
            .await
        } else {
            let list = self
                .request_list
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("request carries no id but no list is configured"))?;
            let list = Arc::clone(list);
            timeout_and_retry(
                "mark request handled",
                self.internal_timeout,
                self.internal_retries,
                move || {
                    let list = Arc::clone(&list);
                    let request = snapshot.clone();
                    async move {
                        list.mark_request_handled(&request).await?;
                        Ok(())
                    }
                },
            )
            .await
        }
    }

    async fn reclaim_with_retry(&self, request: &Request) -> anyhow::Result<()> {
        let snapshot = request.clone();

        if snapshot.id().is_some() {
            let queue = self
                .request_queue
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("request carries an id but no queue is configured"))?;
            let queue = Arc::clone(queue);
            timeout_and_retry(
                "reclaim request",
                self.internal_timeout,
                self.internal_retries,
                move || {
                    let queue = Arc::clone(&queue);
                    let request = snapshot.clone();
                    async move {
                        queue.reclaim_request(&request, false).await?;
                        Ok(())
                    }
                },
            )
            .await
        } else {
            let list = self
                .request_list
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("request carries no id but no list is configured"))?;
            let list = Arc::clone(list);
            timeout_and_retry(
                "reclaim request",
                self.internal_timeout,
                self.internal_retries,
                move || {
                    let list = Arc::clone(&list);
                    let request = snapshot.clone();
                    async move {
                        list.reclaim_request(&request).await?;
                        Ok(())
                    }
                },
            )
            .await
        }
    }

    fn max_requests_reached(&self) -> bool {
        self.max_requests_per_crawl
            .is_some_and(|max| self.handled_count.load(Ordering::SeqCst) >= max)
    }

    async fn is_task_ready(&self) -> anyhow::Result<bool> {
        if self.max_requests_reached() {
            return Ok(false);
        }
        if let Some(list) = &self.request_list
            && !list.is_empty().await?
        {
            return Ok(true);
        }
        if let Some(queue) = &self.request_queue
            && !queue.is_empty().await?
        {
            return Ok(true);
        }
        Ok(false)
    }

    async fn is_finished(&self) -> anyhow::Result<bool> {
        if self.max_requests_reached() {
            info!(
                "Crawler reached max_requests_per_crawl ({}), draining",
                self.max_requests_per_crawl.unwrap_or_default()
            );
            return Ok(true);
        }
        if let Some(list) = &self.request_list
            && !list.is_finished().await?
        {
            return Ok(false);
        }
        if let Some(queue) = &self.request_queue
            && !queue.is_finished().await?
        {
            return Ok(false);
        }
        Ok(true)
    }

    /// React to a migration or abort signal: pause, then checkpoint.
    async fn handle_migration(&self, event: SystemEvent) {
        info!("Received {event} event, pausing the crawl and persisting state");
        if let Some(pool) = self.pool.get()
            && let Err(e) = pool.pause(self.safe_migration_wait).await
        {
            warn!("Some requests did not finish before the migration deadline: {e}");
        }
        self.persist_state().await;
    }

    /// Best-effort checkpoint of the list cursor and the statistics.
    /// Failures are logged, never propagated — persistence must not
    /// take down the crawl.
    async fn persist_state(&self) {
        let persist_list = async {
            if let Some(list) = &self.request_list
                && let Err(e) = list.persist_state().await
            {
                warn!("Failed to persist request list state: {e}");
            }
        };
        let persist_statistics = async {
            if let Err(e) = self.statistics.persist().await {
                warn!("Failed to persist statistics: {e}");
            }
        };
        tokio::join!(persist_list, persist_statistics);
    }
}
