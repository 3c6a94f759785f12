//! Source API client.
//!
//! The source is a document store reachable only through paginated REST
//! endpoints: `GET {base_url}{endpoint}?skip={offset}&limit={limit}`, answering
//! `{ "success": bool, "data"?: [...], "items"?: [...], "error"?: string }`.

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{Error, Result};

/// A source document: an open, string-keyed JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Default retry delay when a 429 carries no usable `Retry-After`.
const DEFAULT_RATE_LIMIT_SECS: u64 = 60;

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY: usize = 200;

/// One page as served by the source.
///
/// `fetched` counts every entry the source returned, including entries that
/// were not JSON objects and so are missing from `records`. Pagination
/// advances by `fetched`, never by `records.len()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Object entries of the page, in source order.
    pub records: Vec<Record>,
    /// Raw number of entries in the page.
    pub fetched: usize,
}

impl Page {
    /// A page made only of well-formed records.
    pub fn new(records: Vec<Record>) -> Self {
        let fetched = records.len();
        Self { records, fetched }
    }

    /// Entries dropped for not being JSON objects.
    pub fn malformed(&self) -> usize {
        self.fetched.saturating_sub(self.records.len())
    }

    /// Whether the source returned nothing at all.
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

/// Port through which exporters read pages of a collection.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch up to `limit` entries of `endpoint` starting at `offset`.
    ///
    /// An empty page means pagination is exhausted.
    async fn fetch_page(&self, endpoint: &str, offset: usize, limit: usize) -> Result<Page>;
}

/// Body of a page response.
#[derive(Debug, Deserialize)]
struct PageResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<String>,
}

impl PageResponse {
    /// Entries from `data`, else `items`, else none.
    fn into_page(self) -> Result<Page> {
        if self.success != Some(true) {
            return Err(Error::SourceResponse(
                self.error
                    .unwrap_or_else(|| "response did not report success".to_string()),
            ));
        }

        let values = self.data.or(self.items).unwrap_or_default();
        let fetched = values.len();
        let records: Vec<Record> = values
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();

        let page = Page { records, fetched };
        if page.malformed() > 0 {
            warn!("{} non-object entries in source page", page.malformed());
        }

        Ok(page)
    }
}

/// HTTP implementation of [`SourceClient`].
pub struct HttpSourceClient {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSourceClient {
    /// Creates a client for the configured source API.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        validate_url(&config.base_url)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Full URL of a collection endpoint.
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_page(
        &self,
        endpoint: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let url = self.endpoint_url(endpoint);
        debug!("GET {} skip={} limit={}", url, offset, limit);

        let mut request = self
            .client
            .get(&url)
            .query(&[("skip", offset), ("limit", limit)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(handle_http_error(status, &body, retry_after));
        }

        let page: PageResponse = response
            .json()
            .await
            .map_err(|e| Error::SourceResponse(format!("invalid JSON from {}: {}", url, e)))?;

        page.into_page()
    }
}

/// Validates the source URL scheme.
pub fn validate_url(url: &str) -> Result<()> {
    let has_valid_scheme = ["http://", "https://"].iter().any(|s| url.starts_with(s));

    if !has_valid_scheme {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }

    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }

    Ok(())
}

/// Maps a non-2xx response to an error.
pub fn handle_http_error(status: StatusCode, body: &str, retry_after: Option<u64>) -> Error {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    match status.as_u16() {
        429 => Error::RateLimit(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_SECS)),
        401 | 403 => Error::Authentication(format!("HTTP {}: {}", status.as_u16(), body)),
        code => Error::SourceUnavailable(format!("HTTP {}: {}", code, body)),
    }
}

#[cfg(test)]
#[path = "source_tests.rs"]
mod tests;
