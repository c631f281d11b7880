//! Request list source declarations and remote source loading

use once_cell::sync::Lazy;
use regex::Regex;

use super::RequestListError;
use crate::request::{Request, RequestOptions};

/// Matches one absolute http(s) URL. Used when a remote source file
/// supplies no extraction regex of its own; applied per line.
static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>\[\]{}|\\^]+"#).expect("URL extraction regex is valid")
});

/// One declared source of requests for a request list.
#[derive(Debug, Clone)]
pub enum RequestListSource {
    /// A single URL with default options.
    Url(String),
    /// A fully constructed request.
    Request(Request),
    /// Construction options for a single request.
    Options(RequestOptions),
    /// A remote text file of URLs, downloaded during initialization.
    RemoteUrl(RemoteUrlSource),
}

/// Descriptor of a remote URL-list file.
#[derive(Debug, Clone)]
pub struct RemoteUrlSource {
    /// Where to download the list from.
    pub requests_from_url: String,
    /// Optional extraction regex applied to the whole body. When
    /// absent, URLs are extracted line by line with a default pattern.
    pub regex: Option<String>,
}

impl From<&str> for RequestListSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<String> for RequestListSource {
    fn from(url: String) -> Self {
        Self::Url(url)
    }
}

impl From<Request> for RequestListSource {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<RequestOptions> for RequestListSource {
    fn from(options: RequestOptions) -> Self {
        Self::Options(options)
    }
}

/// Download a remote source and extract its URLs.
pub(super) async fn fetch_remote_urls(
    client: &reqwest::Client,
    source: &RemoteUrlSource,
) -> Result<Vec<String>, RequestListError> {
    let url = &source.requests_from_url;
    let response = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| RequestListError::RemoteFetch {
            url: url.clone(),
            source: e,
        })?;
    let body = response
        .text()
        .await
        .map_err(|e| RequestListError::RemoteFetch {
            url: url.clone(),
            source: e,
        })?;

    extract_urls(&body, source.regex.as_deref())
}

/// Extract URLs from a downloaded body, either with the caller's regex
/// or the default per-line pattern.
pub(super) fn extract_urls(
    body: &str,
    pattern: Option<&str>,
) -> Result<Vec<String>, RequestListError> {
    match pattern {
        Some(pattern) => {
            let regex = Regex::new(pattern).map_err(|e| RequestListError::InvalidRegex {
                pattern: pattern.to_string(),
                source: e,
            })?;
            Ok(regex
                .find_iter(body)
                .map(|m| m.as_str().to_string())
                .collect())
        }
        None => Ok(body
            .lines()
            .filter_map(|line| URL_REGEX.find(line.trim()))
            .map(|m| m.as_str().to_string())
            .collect()),
    }
}
