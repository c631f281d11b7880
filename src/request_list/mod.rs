//! Static, ordered, deduplicated request source
//!
//! A request list is built once from declared sources (inline URLs,
//! prepared requests, or remote URL-list files), deduplicates them by
//! unique key, and then hands them out in order. Requests that fail
//! mid-flight are reclaimed and re-delivered before any fresh request.
//! The whole cursor — position plus the set of unresolved requests —
//! can be checkpointed to a key-value store and restored after a
//! process restart.

mod sources;
mod state;

pub use sources::{RemoteUrlSource, RequestListSource};
pub use state::RequestListState;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::request::{Request, RequestError, RequestOptions};
use crate::storage::{
    KeyValueStore, REQUEST_LIST_REQUESTS_KEY, REQUEST_LIST_STATE_KEY, StorageError, get_json,
    set_json,
};

/// Async callback yielding extra sources after the inline ones.
pub type SourcesFunction =
    Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Vec<RequestListSource>>> + Send + Sync>;

/// Errors from request list operations.
#[derive(Debug, thiserror::Error)]
pub enum RequestListError {
    /// An operation ran before `initialize()`.
    #[error("request list is not initialized; call initialize() first")]
    NotInitialized,

    /// `mark_request_handled` or `reclaim_request` on a request that
    /// was never delivered or was already resolved.
    #[error("request '{unique_key}' is not being processed")]
    NotInProgress { unique_key: String },

    /// A second `reclaim_request` before the first redelivery.
    #[error("request '{unique_key}' was already reclaimed")]
    AlreadyReclaimed { unique_key: String },

    /// A restored checkpoint does not match the declared sources. Not
    /// recoverable: clear the persisted state or restore the sources.
    #[error("persisted request list state is inconsistent with sources: {0}")]
    InconsistentState(String),

    /// Downloading a remote URL-list source failed.
    #[error("failed to fetch request sources from '{url}'")]
    RemoteFetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A remote source declared an invalid extraction regex.
    #[error("invalid URL extraction regex '{pattern}'")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The user-supplied sources function failed.
    #[error("sources function failed: {0}")]
    SourcesFunction(String),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Builder for a [`RequestList`].
#[derive(Default)]
pub struct RequestListBuilder {
    sources: Vec<RequestListSource>,
    sources_function: Option<SourcesFunction>,
    keep_duplicate_urls: bool,
    state: Option<RequestListState>,
    store: Option<Arc<dyn KeyValueStore>>,
    persist_state_key: Option<String>,
    persist_requests_key: Option<String>,
}

impl RequestListBuilder {
    /// Append one source.
    #[must_use]
    pub fn source(mut self, source: impl Into<RequestListSource>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Append many sources.
    #[must_use]
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RequestListSource>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    /// Async callback producing additional sources, run after the
    /// inline ones during initialization.
    #[must_use]
    pub fn sources_function(mut self, f: SourcesFunction) -> Self {
        self.sources_function = Some(f);
        self
    }

    /// Keep requests whose unique key collides, disambiguated with a
    /// positional suffix, instead of silently skipping them.
    #[must_use]
    pub fn keep_duplicate_urls(mut self, keep: bool) -> Self {
        self.keep_duplicate_urls = keep;
        self
    }

    /// Resume from an explicit checkpoint instead of loading one from
    /// the store.
    #[must_use]
    pub fn state(mut self, state: RequestListState) -> Self {
        self.state = Some(state);
        self
    }

    /// Persist checkpoints (and the loaded source snapshot) through
    /// this store.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn persist_state_key(mut self, key: impl Into<String>) -> Self {
        self.persist_state_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn persist_requests_key(mut self, key: impl Into<String>) -> Self {
        self.persist_requests_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn build(self) -> RequestList {
        RequestList {
            inner: Mutex::new(ListInner::default()),
            setup: Mutex::new(Some(ListSetup {
                sources: self.sources,
                sources_function: self.sources_function,
                state: self.state,
            })),
            initialized: AtomicBool::new(false),
            keep_duplicate_urls: self.keep_duplicate_urls,
            store: self.store,
            persist_state_key: self
                .persist_state_key
                .unwrap_or_else(|| REQUEST_LIST_STATE_KEY.to_string()),
            persist_requests_key: self
                .persist_requests_key
                .unwrap_or_else(|| REQUEST_LIST_REQUESTS_KEY.to_string()),
        }
    }
}

struct ListSetup {
    sources: Vec<RequestListSource>,
    sources_function: Option<SourcesFunction>,
    state: Option<RequestListState>,
}

#[derive(Default)]
struct ListInner {
    requests: Vec<Request>,
    unique_key_to_index: HashMap<String, usize>,
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed: HashSet<String>,
}

/// Static, deterministic, deduplicated iterator over requests,
/// resumable across process restarts.
pub struct RequestList {
    inner: Mutex<ListInner>,
    setup: Mutex<Option<ListSetup>>,
    initialized: AtomicBool,
    keep_duplicate_urls: bool,
    store: Option<Arc<dyn KeyValueStore>>,
    persist_state_key: String,
    persist_requests_key: String,
}

impl RequestList {
    #[must_use]
    pub fn builder() -> RequestListBuilder {
        RequestListBuilder::default()
    }

    /// Convenience constructor for a list of plain URLs with no
    /// persistence.
    #[must_use]
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::builder()
            .sources(urls.into_iter().map(|u| u.into()))
            .build()
    }

    /// Load all sources in declaration order, deduplicate, and apply
    /// any resumption checkpoint.
    ///
    /// Inline sources are read first, then the sources function. Remote
    /// URL-list sources are downloaded as they are reached, preserving
    /// overall declaration order. Once everything is loaded the source
    /// container is drained; a second call is a no-op.
    pub async fn initialize(&self) -> Result<(), RequestListError> {
        let Some(setup) = self.setup.lock().take() else {
            warn!("Request list already initialized, ignoring repeated initialize()");
            return Ok(());
        };

        // A checkpoint supplied at construction wins over a stored one.
        let mut checkpoint = setup.state;
        if checkpoint.is_none()
            && let Some(store) = &self.store
        {
            checkpoint =
                get_json::<RequestListState>(store.as_ref(), &self.persist_state_key).await?;
            if checkpoint.is_some() {
                info!("Restored request list checkpoint from key-value store");
            }
        }

        let mut requests: Vec<Request> = Vec::new();
        let mut unique_key_to_index: HashMap<String, usize> = HashMap::new();
        let mut loaded_from_snapshot = false;

        // A persisted snapshot of the loaded sources takes precedence:
        // it is already deduplicated and, unlike a remote source file,
        // guaranteed not to have drifted since the checkpoint.
        if let Some(store) = &self.store
            && let Some(persisted) =
                get_json::<Vec<Request>>(store.as_ref(), &self.persist_requests_key).await?
        {
            info!(
                "Using persisted request snapshot ({} requests)",
                persisted.len()
            );
            for request in persisted {
                let index = requests.len();
                unique_key_to_index.insert(request.unique_key().to_string(), index);
                requests.push(request);
            }
            loaded_from_snapshot = true;
        }

        if !loaded_from_snapshot {
            let mut duplicates = 0usize;
            let mut client: Option<reqwest::Client> = None;

            for source in setup.sources {
                Self::load_source(
                    source,
                    &mut requests,
                    &mut unique_key_to_index,
                    self.keep_duplicate_urls,
                    &mut duplicates,
                    &mut client,
                )
                .await?;
            }

            if let Some(sources_function) = setup.sources_function {
                let extra = sources_function()
                    .await
                    .map_err(|e| RequestListError::SourcesFunction(format!("{e:#}")))?;
                for source in extra {
                    Self::load_source(
                        source,
                        &mut requests,
                        &mut unique_key_to_index,
                        self.keep_duplicate_urls,
                        &mut duplicates,
                        &mut client,
                    )
                    .await?;
                }
            }

            if duplicates > 0 {
                info!("Skipped {duplicates} requests with duplicate unique keys");
            }

            if let Some(store) = &self.store {
                set_json(store.as_ref(), &self.persist_requests_key, &requests).await?;
            }
        }

        let mut inner = self.inner.lock();
        inner.requests = requests;
        inner.unique_key_to_index = unique_key_to_index;
        if let Some(state) = checkpoint {
            Self::apply_checkpoint(&mut inner, state)?;
        }
        drop(inner);

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn load_source(
        source: RequestListSource,
        requests: &mut Vec<Request>,
        unique_key_to_index: &mut HashMap<String, usize>,
        keep_duplicate_urls: bool,
        duplicates: &mut usize,
        client: &mut Option<reqwest::Client>,
    ) -> Result<(), RequestListError> {
        match source {
            RequestListSource::Url(url) => {
                let request = Request::new(url)?;
                Self::add_request(requests, unique_key_to_index, request, keep_duplicate_urls, duplicates);
            }
            RequestListSource::Request(request) => {
                Self::add_request(requests, unique_key_to_index, request, keep_duplicate_urls, duplicates);
            }
            RequestListSource::Options(options) => {
                let request = Request::from_options(options)?;
                Self::add_request(requests, unique_key_to_index, request, keep_duplicate_urls, duplicates);
            }
            RequestListSource::RemoteUrl(remote) => {
                let client = client.get_or_insert_with(reqwest::Client::new);
                let urls = sources::fetch_remote_urls(client, &remote).await?;
                info!(
                    "Fetched {} URLs from remote source '{}'",
                    urls.len(),
                    remote.requests_from_url
                );
                for url in urls {
                    let request = Request::new(url)?;
                    Self::add_request(
                        requests,
                        unique_key_to_index,
                        request,
                        keep_duplicate_urls,
                        duplicates,
                    );
                }
            }
        }
        Ok(())
    }

    fn add_request(
        requests: &mut Vec<Request>,
        unique_key_to_index: &mut HashMap<String, usize>,
        mut request: Request,
        keep_duplicate_urls: bool,
        duplicates: &mut usize,
    ) {
        if unique_key_to_index.contains_key(request.unique_key()) {
            if !keep_duplicate_urls {
                debug!(
                    "Skipping duplicate request with unique key '{}'",
                    request.unique_key()
                );
                *duplicates += 1;
                return;
            }
            // Positional suffix keeps persisted checkpoints compatible.
            request.suffix_unique_key(requests.len());
            if unique_key_to_index.contains_key(request.unique_key()) {
                warn!(
                    "Unique key '{}' still collides after positional suffix, skipping",
                    request.unique_key()
                );
                *duplicates += 1;
                return;
            }
        }

        let index = requests.len();
        unique_key_to_index.insert(request.unique_key().to_string(), index);
        requests.push(request);
    }

    fn apply_checkpoint(
        inner: &mut ListInner,
        state: RequestListState,
    ) -> Result<(), RequestListError> {
        if state.next_index > inner.requests.len() {
            return Err(RequestListError::InconsistentState(format!(
                "checkpoint nextIndex {} exceeds the {} loaded requests",
                state.next_index,
                inner.requests.len()
            )));
        }

        if state.next_index < inner.requests.len() {
            let expected = inner.requests[state.next_index].unique_key();
            if state.next_unique_key.as_deref() != Some(expected) {
                return Err(RequestListError::InconsistentState(format!(
                    "request at position {} has unique key '{}' but the checkpoint expects {:?}; \
                     the sources have changed since the checkpoint was taken",
                    state.next_index, expected, state.next_unique_key
                )));
            }
        } else if state.next_unique_key.is_some() {
            return Err(RequestListError::InconsistentState(format!(
                "checkpoint expects a request with unique key {:?} past the end of the sources",
                state.next_unique_key
            )));
        }

        let mut in_progress = HashSet::with_capacity(state.in_progress.len());
        for unique_key in state.in_progress.keys() {
            match inner.unique_key_to_index.get(unique_key) {
                Some(&index) if index < state.next_index => {
                    in_progress.insert(unique_key.clone());
                }
                _ => {
                    return Err(RequestListError::InconsistentState(format!(
                        "in-progress unique key '{unique_key}' does not match any delivered request"
                    )));
                }
            }
        }

        inner.next_index = state.next_index;
        // Everything that was mid-flight at checkpoint time gets
        // re-delivered.
        inner.reclaimed = in_progress.clone();
        inner.in_progress = in_progress;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<(), RequestListError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RequestListError::NotInitialized)
        }
    }

    /// Return the next request to process: an arbitrary reclaimed
    /// request if any exist, otherwise the next fresh one in source
    /// order, otherwise `None`.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>, RequestListError> {
        self.ensure_initialized()?;
        let mut inner = self.inner.lock();

        if let Some(unique_key) = inner.reclaimed.iter().next().cloned() {
            inner.reclaimed.remove(&unique_key);
            let index = *inner.unique_key_to_index.get(&unique_key).ok_or_else(|| {
                RequestListError::InconsistentState(format!(
                    "reclaimed unique key '{unique_key}' is missing from the index"
                ))
            })?;
            return Ok(Some(inner.requests[index].clone()));
        }

        if inner.next_index < inner.requests.len() {
            let request = inner.requests[inner.next_index].clone();
            inner.in_progress.insert(request.unique_key().to_string());
            inner.next_index += 1;
            return Ok(Some(request));
        }

        Ok(None)
    }

    /// Resolve a delivered request as done. It will never be delivered
    /// again.
    pub async fn mark_request_handled(&self, request: &Request) -> Result<(), RequestListError> {
        self.ensure_initialized()?;
        let mut inner = self.inner.lock();
        let unique_key = request.unique_key();
        Self::check_in_progress(&inner, unique_key)?;
        inner.in_progress.remove(unique_key);
        Ok(())
    }

    /// Return a delivered request to the pending set for redelivery.
    ///
    /// The worker's copy is written back so retry bookkeeping (retry
    /// count, error messages) survives into the redelivered request.
    pub async fn reclaim_request(&self, request: &Request) -> Result<(), RequestListError> {
        self.ensure_initialized()?;
        let mut inner = self.inner.lock();
        let unique_key = request.unique_key();
        Self::check_in_progress(&inner, unique_key)?;
        if let Some(&index) = inner.unique_key_to_index.get(unique_key) {
            inner.requests[index] = request.clone();
        }
        inner.reclaimed.insert(unique_key.to_string());
        Ok(())
    }

    fn check_in_progress(inner: &ListInner, unique_key: &str) -> Result<(), RequestListError> {
        if !inner.in_progress.contains(unique_key) {
            return Err(RequestListError::NotInProgress {
                unique_key: unique_key.to_string(),
            });
        }
        if inner.reclaimed.contains(unique_key) {
            return Err(RequestListError::AlreadyReclaimed {
                unique_key: unique_key.to_string(),
            });
        }
        Ok(())
    }

    /// True when there is nothing left to deliver right now. Requests
    /// may still be in progress.
    pub async fn is_empty(&self) -> Result<bool, RequestListError> {
        self.ensure_initialized()?;
        let inner = self.inner.lock();
        Ok(inner.reclaimed.is_empty() && inner.next_index >= inner.requests.len())
    }

    /// True when every request was delivered and resolved.
    pub async fn is_finished(&self) -> Result<bool, RequestListError> {
        self.ensure_initialized()?;
        let inner = self.inner.lock();
        Ok(inner.in_progress.is_empty() && inner.next_index >= inner.requests.len())
    }

    /// Total number of unique requests in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    #[must_use]
    pub fn is_empty_source(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests resolved so far.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.next_index - inner.in_progress.len()
    }

    /// Snapshot of the resumption checkpoint.
    pub fn get_state(&self) -> RequestListState {
        let inner = self.inner.lock();
        RequestListState {
            next_index: inner.next_index,
            next_unique_key: inner
                .requests
                .get(inner.next_index)
                .map(|r| r.unique_key().to_string()),
            in_progress: inner
                .in_progress
                .iter()
                .map(|key| (key.clone(), true))
                .collect(),
        }
    }

    /// Write the checkpoint through the key-value store. Without a
    /// configured store this logs and succeeds.
    pub async fn persist_state(&self) -> Result<(), RequestListError> {
        self.ensure_initialized()?;
        let Some(store) = &self.store else {
            debug!("Request list has no key-value store, skipping persist");
            return Ok(());
        };
        let state = self.get_state();
        set_json(store.as_ref(), &self.persist_state_key, &state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_initialization() {
        let list = RequestList::from_urls(["http://example.com/a"]);
        assert!(matches!(
            list.fetch_next_request().await,
            Err(RequestListError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn delivers_in_source_order() {
        let list = RequestList::from_urls([
            "http://example.com/1",
            "http://example.com/2",
            "http://example.com/3",
        ]);
        list.initialize().await.expect("initialize");

        let mut urls = Vec::new();
        while let Some(request) = list.fetch_next_request().await.expect("fetch") {
            urls.push(request.url().to_string());
            list.mark_request_handled(&request).await.expect("mark");
        }
        assert_eq!(
            urls,
            vec![
                "http://example.com/1",
                "http://example.com/2",
                "http://example.com/3"
            ]
        );
        assert!(list.is_finished().await.expect("is_finished"));
    }

    #[tokio::test]
    async fn deduplicates_by_unique_key() {
        let list = RequestList::from_urls([
            "http://example.com/1",
            "http://example.com/1#frag",
            "http://example.com/1",
        ]);
        list.initialize().await.expect("initialize");
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn keep_duplicate_urls_appends_positional_suffix() {
        let list = RequestList::builder()
            .sources(["http://example.com/1", "http://example.com/1"])
            .keep_duplicate_urls(true)
            .build();
        list.initialize().await.expect("initialize");
        assert_eq!(list.len(), 2);

        let first = list.fetch_next_request().await.expect("fetch").expect("some");
        let second = list.fetch_next_request().await.expect("fetch").expect("some");
        assert_eq!(first.unique_key(), "http://example.com/1");
        assert_eq!(second.unique_key(), "http://example.com/1-1");
    }

    #[tokio::test]
    async fn reclaimed_requests_come_back_before_fresh_ones() {
        let list = RequestList::from_urls(["http://example.com/1", "http://example.com/2"]);
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().await.expect("fetch").expect("some");
        list.reclaim_request(&first).await.expect("reclaim");

        let redelivered = list.fetch_next_request().await.expect("fetch").expect("some");
        assert_eq!(redelivered.unique_key(), first.unique_key());
    }

    #[tokio::test]
    async fn double_reclaim_is_an_error() {
        let list = RequestList::from_urls(["http://example.com/1"]);
        list.initialize().await.expect("initialize");
        let request = list.fetch_next_request().await.expect("fetch").expect("some");
        list.reclaim_request(&request).await.expect("first reclaim");
        assert!(matches!(
            list.reclaim_request(&request).await,
            Err(RequestListError::AlreadyReclaimed { .. })
        ));
    }

    #[tokio::test]
    async fn mark_handled_requires_in_progress() {
        let list = RequestList::from_urls(["http://example.com/1"]);
        list.initialize().await.expect("initialize");
        let stranger = Request::new("http://example.com/other").expect("valid");
        assert!(matches!(
            list.mark_request_handled(&stranger).await,
            Err(RequestListError::NotInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn empty_and_finished_track_reclaimed_and_in_progress() {
        let list = RequestList::from_urls(["http://example.com/1"]);
        list.initialize().await.expect("initialize");

        assert!(!list.is_empty().await.expect("is_empty"));
        let request = list.fetch_next_request().await.expect("fetch").expect("some");
        // Nothing left to deliver, but the attempt is unresolved.
        assert!(list.is_empty().await.expect("is_empty"));
        assert!(!list.is_finished().await.expect("is_finished"));

        list.reclaim_request(&request).await.expect("reclaim");
        assert!(!list.is_empty().await.expect("is_empty"));

        let request = list.fetch_next_request().await.expect("fetch").expect("some");
        list.mark_request_handled(&request).await.expect("mark");
        assert!(list.is_finished().await.expect("is_finished"));
        assert_eq!(list.handled_count(), 1);
    }
}
