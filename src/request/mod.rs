//! The unit of crawling work: a single URL plus metadata and retry
//! bookkeeping.
//!
//! A [`Request`] is owned by exactly one source (a request list or a
//! request queue) at rest. While an attempt is in flight the worker
//! holds a clone; the source keeps the authoritative pending/in-progress
//! bookkeeping keyed by the request's unique key or id. The URL and the
//! unique key are fixed at construction — everything a user handler is
//! allowed to change (headers, payload, user data, the no-retry flag)
//! is a public field or has a setter.

mod unique_key;

pub use unique_key::normalize_url;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors from constructing a [`Request`].
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The URL could not be parsed.
    #[error("invalid request URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// An explicit unique key was empty.
    #[error("unique key must be a non-empty string")]
    EmptyUniqueKey,
}

/// HTTP method of a request. Opaque to the core engine; carried through
/// to whatever fetcher consumes the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        };
        write!(f, "{name}")
    }
}

/// Construction options for a [`Request`].
///
/// ```rust
/// use crawlkit::request::{Request, RequestOptions};
///
/// let request = Request::from_options(
///     RequestOptions::new("http://example.com/item?id=1")
///         .with_user_data(serde_json::json!({ "label": "DETAIL" })),
/// ).expect("valid URL");
/// assert_eq!(request.unique_key(), "http://example.com/item?id=1");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestOptions {
    pub url: String,
    /// Explicit deduplication key. Defaults to the normalised URL.
    pub unique_key: Option<String>,
    pub method: RequestMethod,
    pub headers: HashMap<String, String>,
    pub payload: Option<Vec<u8>>,
    pub user_data: serde_json::Value,
    /// Preserve the URL fragment when deriving the default unique key.
    pub keep_url_fragment: bool,
    /// Start with retries suppressed.
    pub no_retry: bool,
}

impl RequestOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_data: serde_json::Value::Null,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = Some(unique_key.into());
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_user_data(mut self, user_data: serde_json::Value) -> Self {
        self.user_data = user_data;
        self
    }

    #[must_use]
    pub fn with_keep_url_fragment(mut self, keep: bool) -> Self {
        self.keep_url_fragment = keep;
        self
    }

    #[must_use]
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }
}

/// A single URL to process, with metadata and mutable retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Storage-assigned id. Present only on requests delivered by a
    /// request queue; requests held by a request list have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    url: String,
    unique_key: String,

    #[serde(default)]
    pub method: RequestMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub user_data: serde_json::Value,
    /// Set by a user handler to suppress further retries of this
    /// request after a failure.
    #[serde(default)]
    pub no_retry: bool,

    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    error_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loaded_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a request from a bare URL with the default unique key.
    pub fn new(url: impl Into<String>) -> Result<Self, RequestError> {
        Self::from_options(RequestOptions::new(url))
    }

    /// Build a request from full construction options.
    pub fn from_options(options: RequestOptions) -> Result<Self, RequestError> {
        let unique_key = match options.unique_key {
            Some(key) => {
                if key.is_empty() {
                    return Err(RequestError::EmptyUniqueKey);
                }
                key
            }
            None => normalize_url(&options.url, options.keep_url_fragment).map_err(|source| {
                RequestError::InvalidUrl {
                    url: options.url.clone(),
                    source,
                }
            })?,
        };

        Ok(Self {
            id: None,
            url: options.url,
            unique_key,
            method: options.method,
            headers: options.headers,
            payload: options.payload,
            user_data: options.user_data,
            no_retry: options.no_retry,
            retry_count: 0,
            error_messages: Vec::new(),
            loaded_url: None,
            handled_at: None,
        })
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    /// Disambiguate a duplicate by appending its position in the final
    /// request sequence. Persisted checkpoints depend on this exact
    /// `-{index}` encoding.
    pub(crate) fn suffix_unique_key(&mut self, index: usize) {
        self.unique_key = format!("{}-{index}", self.unique_key);
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub(crate) fn bump_retry_count(&mut self) {
        self.retry_count += 1;
    }

    #[must_use]
    pub fn error_messages(&self) -> &[String] {
        &self.error_messages
    }

    /// Record a failed attempt's error chain on the request.
    pub fn push_error_message(&mut self, error: &anyhow::Error) {
        // {:#} keeps the full context chain on one line.
        self.error_messages.push(format!("{error:#}"));
    }

    /// Final URL after redirects. Set by a fetcher, cleared by the
    /// crawler before each attempt.
    #[must_use]
    pub fn loaded_url(&self) -> Option<&str> {
        self.loaded_url.as_deref()
    }

    pub fn set_loaded_url(&mut self, loaded_url: impl Into<String>) {
        self.loaded_url = Some(loaded_url.into());
    }

    pub(crate) fn clear_loaded_url(&mut self) {
        self.loaded_url = None;
    }

    #[must_use]
    pub fn handled_at(&self) -> Option<DateTime<Utc>> {
        self.handled_at
    }

    /// Stamp the handled instant. Write-once: a second call is ignored.
    pub(crate) fn mark_handled_at(&mut self, when: DateTime<Utc>) {
        if self.handled_at.is_none() {
            self.handled_at = Some(when);
        }
    }

    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}
