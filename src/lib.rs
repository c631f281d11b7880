//! crawlkit — the core engine of a generic web-crawling framework.
//!
//! The engine is three interlocking pieces:
//!
//! - **Request sources**: a static, ordered, deduplicated
//!   [`RequestList`] and a dynamic, persistent [`RequestQueue`], both
//!   exposing the same fetch / reclaim / mark-handled contract and
//!   together guaranteeing at-most-once successful processing per
//!   unique URL.
//! - **An autoscaling worker pool**: [`AutoscaledPool`] keeps actual
//!   concurrency near a desired target and drifts the target up or
//!   down following the [`LoadMonitor`]'s idle/overloaded verdicts.
//! - **A retry lifecycle**: [`BasicCrawler`] drives every request
//!   attempt through fetch, user handler under timeout, and
//!   success/retry/failure resolution, collecting [`Statistics`] and
//!   checkpointing through a pluggable [`KeyValueStore`] when the host
//!   signals migration.
//!
//! Fetching pages, parsing HTML, and everything else specific to a
//! protocol lives in the user handler or in crates layered on top.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crawlkit::{BasicCrawler, CrawlingContext, RequestList};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let list = Arc::new(RequestList::from_urls([
//!     "http://example.com/a",
//!     "http://example.com/b",
//! ]));
//!
//! let crawler = BasicCrawler::builder()
//!     .request_list(list)
//!     .max_concurrency(10)
//!     .handle_request_function(|ctx: CrawlingContext| async move {
//!         let url = ctx.request.lock().await.url().to_string();
//!         println!("processing {url}");
//!         anyhow::Ok(())
//!     })
//!     .build()?;
//!
//! crawler.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod crawler;
pub mod events;
pub mod load_monitor;
pub mod pool;
pub mod request;
pub mod request_list;
pub mod request_queue;
pub mod session;
pub mod statistics;
pub mod storage;
pub mod utils;

pub use crawler::{
    BasicCrawler, BasicCrawlerBuilder, CrawlerError, CrawlerHandle, CrawlingContext,
    FailedRequestHandler, RequestHandler, SharedRequest,
};
pub use events::{EventBus, EventBusError, SystemEvent};
pub use load_monitor::{LoadMonitor, LoadMonitorOptions, SystemStatus};
pub use pool::{AutoscaledPool, AutoscaledPoolOptions, PoolError};
pub use request::{Request, RequestError, RequestMethod, RequestOptions};
pub use request_list::{
    RemoteUrlSource, RequestList, RequestListBuilder, RequestListError, RequestListSource,
    RequestListState,
};
pub use request_queue::{
    InMemoryQueueStorage, QueueHead, QueueHeadItem, QueueInfo, QueueOperationInfo, RequestQueue,
    RequestQueueError, RequestQueueStorage,
};
pub use session::{Session, SessionHandle, SessionPool, SessionPoolOptions};
pub use statistics::{Statistics, StatisticsOptions, StatisticsState};
pub use storage::{
    FsKeyValueStore, KeyValueStore, MemoryKeyValueStore, REQUEST_LIST_REQUESTS_KEY,
    REQUEST_LIST_STATE_KEY, STATISTICS_STATE_KEY, StorageError,
};
