//! Crawler configuration builder

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use once_cell::sync::OnceCell;

use super::{BasicCrawler, CrawlerError, CrawlerInner, FailedRequestHandler, RequestHandler};
use crate::events::EventBus;
use crate::load_monitor::LoadMonitor;
use crate::pool::AutoscaledPoolOptions;
use crate::request_list::RequestList;
use crate::request_queue::RequestQueue;
use crate::session::{SessionPool, SessionPoolOptions};
use crate::statistics::{Statistics, StatisticsOptions};
use crate::storage::KeyValueStore;
use crate::utils::constants::{
    DEFAULT_HANDLE_REQUEST_TIMEOUT, DEFAULT_INTERNAL_TIMEOUT, DEFAULT_INTERNAL_TIMEOUT_RETRIES,
    DEFAULT_MAX_REQUEST_RETRIES, DEFAULT_SAFE_MIGRATION_WAIT,
};

/// The user-handler timeout is carried as signed 32-bit milliseconds in
/// persisted form; larger values are clamped.
const MAX_HANDLE_REQUEST_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// Builder for a [`BasicCrawler`].
pub struct BasicCrawlerBuilder {
    request_list: Option<Arc<RequestList>>,
    request_queue: Option<Arc<RequestQueue>>,
    handler: Option<Arc<dyn RequestHandler>>,
    failed_handler: Option<Arc<dyn FailedRequestHandler>>,
    handle_request_timeout: Duration,
    max_request_retries: u32,
    max_requests_per_crawl: Option<u64>,
    pool_options: AutoscaledPoolOptions,
    use_session_pool: bool,
    session_pool_options: SessionPoolOptions,
    event_bus: Option<Arc<EventBus>>,
    store: Option<Arc<dyn KeyValueStore>>,
    statistics_options: StatisticsOptions,
    safe_migration_wait: Duration,
    internal_timeout: Duration,
    internal_retries: u32,
}

impl Default for BasicCrawlerBuilder {
    fn default() -> Self {
        Self {
            request_list: None,
            request_queue: None,
            handler: None,
            failed_handler: None,
            handle_request_timeout: DEFAULT_HANDLE_REQUEST_TIMEOUT,
            max_request_retries: DEFAULT_MAX_REQUEST_RETRIES,
            max_requests_per_crawl: None,
            pool_options: AutoscaledPoolOptions::default(),
            use_session_pool: true,
            session_pool_options: SessionPoolOptions::default(),
            event_bus: None,
            store: None,
            statistics_options: StatisticsOptions::default(),
            safe_migration_wait: DEFAULT_SAFE_MIGRATION_WAIT,
            internal_timeout: DEFAULT_INTERNAL_TIMEOUT,
            internal_retries: DEFAULT_INTERNAL_TIMEOUT_RETRIES,
        }
    }
}

impl BasicCrawlerBuilder {
    #[must_use]
    pub fn request_list(mut self, list: Arc<RequestList>) -> Self {
        self.request_list = Some(list);
        self
    }

    #[must_use]
    pub fn request_queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.request_queue = Some(queue);
        self
    }

    /// The per-request handler. Required.
    #[must_use]
    pub fn handle_request_function(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Invoked once per request after its retries are exhausted.
    /// Defaults to logging the error.
    #[must_use]
    pub fn handle_failed_request_function(
        mut self,
        handler: impl FailedRequestHandler + 'static,
    ) -> Self {
        self.failed_handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn handle_request_timeout_secs(mut self, secs: u64) -> Self {
        self.handle_request_timeout = Duration::from_secs(secs);
        self
    }

    #[must_use]
    pub fn handle_request_timeout(mut self, timeout: Duration) -> Self {
        self.handle_request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_request_retries(mut self, retries: u32) -> Self {
        self.max_request_retries = retries;
        self
    }

    /// Soft ceiling on resolved requests: once reached, no new requests
    /// start and the crawl drains.
    #[must_use]
    pub fn max_requests_per_crawl(mut self, max: u64) -> Self {
        self.max_requests_per_crawl = Some(max);
        self
    }

    #[must_use]
    pub fn min_concurrency(mut self, min: usize) -> Self {
        self.pool_options.min_concurrency = min;
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.pool_options.max_concurrency = max;
        self
    }

    /// Full worker-pool configuration; the `min_concurrency` /
    /// `max_concurrency` shorthands mutate the same options.
    #[must_use]
    pub fn autoscaled_pool_options(mut self, options: AutoscaledPoolOptions) -> Self {
        self.pool_options = options;
        self
    }

    #[must_use]
    pub fn use_session_pool(mut self, use_session_pool: bool) -> Self {
        self.use_session_pool = use_session_pool;
        self
    }

    #[must_use]
    pub fn session_pool_options(mut self, options: SessionPoolOptions) -> Self {
        self.session_pool_options = options;
        self
    }

    /// Bus carrying host lifecycle events (migration, abort, persist).
    #[must_use]
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Key-value store for the statistics checkpoint.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn statistics_options(mut self, options: StatisticsOptions) -> Self {
        self.statistics_options = options;
        self
    }

    /// Drain budget when the host signals migration or abort.
    #[must_use]
    pub fn safe_migration_wait(mut self, wait: Duration) -> Self {
        self.safe_migration_wait = wait;
        self
    }

    /// Timeout and retry budget for internal source operations.
    #[must_use]
    pub fn internal_timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.internal_timeout = timeout;
        self.internal_retries = retries;
        self
    }

    /// Validate and construct the crawler.
    pub fn build(mut self) -> Result<BasicCrawler, CrawlerError> {
        let handler = self.handler.ok_or_else(|| {
            CrawlerError::InvalidOptions("handle_request_function is required".to_string())
        })?;
        if self.request_list.is_none() && self.request_queue.is_none() {
            return Err(CrawlerError::InvalidOptions(
                "at least one of request_list and request_queue is required".to_string(),
            ));
        }
        self.pool_options.validate()?;

        if self.handle_request_timeout > MAX_HANDLE_REQUEST_TIMEOUT {
            self.handle_request_timeout = MAX_HANDLE_REQUEST_TIMEOUT;
        }

        // The crawler owns the load monitor lifecycle; share one with
        // the pool unless the caller injected their own.
        let load_monitor = self
            .pool_options
            .load_monitor
            .clone()
            .unwrap_or_else(|| Arc::new(LoadMonitor::default()));
        self.pool_options.load_monitor = Some(Arc::clone(&load_monitor));

        let statistics = Arc::new(Statistics::new(
            self.store.clone(),
            self.statistics_options,
        ));

        let session_pool = self
            .use_session_pool
            .then(|| Arc::new(SessionPool::new(self.session_pool_options)));

        Ok(BasicCrawler {
            inner: Arc::new(CrawlerInner {
                request_list: self.request_list,
                request_queue: self.request_queue,
                handler,
                failed_handler: self.failed_handler,
                statistics,
                session_pool,
                event_bus: self.event_bus,
                load_monitor,
                pool: OnceCell::new(),
                pool_options: self.pool_options,
                handled_count: AtomicU64::new(0),
                handle_request_timeout: self.handle_request_timeout,
                max_request_retries: self.max_request_retries,
                max_requests_per_crawl: self.max_requests_per_crawl,
                internal_timeout: self.internal_timeout,
                internal_retries: self.internal_retries,
                safe_migration_wait: self.safe_migration_wait,
            }),
        })
    }
}
