//! Fetch types and the network boundary.
//!
//! Strategies and lifecycle code talk to the network exclusively through the
//! [`Fetch`] trait, so tests substitute in-memory fetchers and the production
//! path uses the reqwest-backed [`HttpFetcher`].

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use offkit_cache::CacheEntry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

/// Errors crossing the fetch boundary.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Unexpected status: {0}")]
    UnexpectedStatus(u16),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Request mode, as the page issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    SameOrigin,
    #[default]
    NoCors,
    Cors,
}

/// What the request is fetching, when the issuer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    #[default]
    Empty,
}

/// HTTP cache interaction mode carried by the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpCacheMode {
    #[default]
    Default,
    NoCache,
    NoStore,
    Reload,
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: Method,
    pub mode: RequestMode,
    pub destination: Destination,
    pub cache_mode: HttpCacheMode,
    pub headers: HeaderMap,
}

impl FetchRequest {
    /// A plain GET for a subresource.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            mode: RequestMode::default(),
            destination: Destination::default(),
            cache_mode: HttpCacheMode::default(),
            headers: HeaderMap::new(),
        }
    }

    /// A top-level navigation request.
    pub fn navigation(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    /// Set the destination.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the HTTP cache mode.
    pub fn with_cache_mode(mut self, cache_mode: HttpCacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    /// Set a request method other than GET.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header. Invalid names or values are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// The request's Cache-Control header, if present and readable.
    pub fn cache_control(&self) -> Option<&str> {
        self.headers
            .get(http::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
    }
}

/// A response snapshot flowing back to the page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether this snapshot was served from the cache store.
    pub from_cache: bool,
}

impl FetchResponse {
    /// A 200 response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// An empty synthetic response with the given status.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            from_cache: false,
        }
    }

    /// The synthetic 503 served when a navigation has no fallback left.
    pub fn offline_placeholder() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers,
            body: Bytes::from_static(b"Offline"),
            from_cache: false,
        }
    }

    /// Add a header. Invalid names or values are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.insert(n, v);
        }
        self
    }

    /// Whether this is exactly a 200, the only status the store admits.
    pub fn is_ok_status(&self) -> bool {
        self.status == StatusCode::OK
    }

    /// Rehydrate a response from a stored snapshot.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }
        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(entry.body.clone()),
            from_cache: true,
        }
    }

    /// Snapshot this response for storage under the request URL.
    pub fn to_entry(&self, url: &Url) -> CacheEntry {
        let mut headers = HashMap::new();
        for (name, value) in &self.headers {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }
        CacheEntry::new(url, self.status.as_u16(), headers, self.body.to_vec())
    }
}

/// The network boundary.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Perform the request against the live network.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Shared fetcher handle, cloned into background refresh tasks.
pub type SharedFetcher = Arc<dyn Fetch>;

/// Configuration for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Transport-owned request timeout; strategies add none of their own.
    pub timeout: Duration,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: "OffKit/1.0".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Live-network fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with the given configuration.
    pub fn new(config: HttpFetcherConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        debug!(url = %request.url, method = %request.method, "fetching");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        // A plain HTTP client has no disk cache of its own; bypass modes
        // translate to headers that defeat intermediate caches instead.
        if matches!(
            request.cache_mode,
            HttpCacheMode::NoCache | HttpCacheMode::NoStore | HttpCacheMode::Reload
        ) {
            builder = builder
                .header(http::header::CACHE_CONTROL, "no-cache")
                .header(http::header::PRAGMA, "no-cache");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        trace!(url = %request.url, status = %status, body_len = body.len(), "response received");

        Ok(FetchResponse {
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builders() {
        let url = Url::parse("https://example.com/styles.css").unwrap();
        let request = FetchRequest::get(url.clone())
            .with_destination(Destination::Style)
            .with_cache_mode(HttpCacheMode::NoStore)
            .with_header("cache-control", "max-age=0");

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.destination, Destination::Style);
        assert_eq!(request.cache_mode, HttpCacheMode::NoStore);
        assert_eq!(request.cache_control(), Some("max-age=0"));
    }

    #[test]
    fn test_navigation_request() {
        let url = Url::parse("https://example.com/").unwrap();
        let request = FetchRequest::navigation(url);
        assert_eq!(request.mode, RequestMode::Navigate);
        assert_eq!(request.destination, Destination::Document);
    }

    #[test]
    fn test_offline_placeholder() {
        let response = FetchResponse::offline_placeholder();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&response.body[..], b"Offline");
    }

    #[test]
    fn test_entry_round_trip() {
        let url = Url::parse("https://example.com/a.js").unwrap();
        let response = FetchResponse::ok("let x = 1;").with_header("content-type", "text/javascript");

        let entry = response.to_entry(&url);
        assert_eq!(entry.status, 200);

        let back = FetchResponse::from_entry(&entry);
        assert!(back.from_cache);
        assert_eq!(back.status, StatusCode::OK);
        assert_eq!(back.body, response.body);
        assert_eq!(
            back.headers.get("content-type").unwrap(),
            "text/javascript"
        );
    }

    #[tokio::test]
    async fn test_http_fetcher_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpFetcherConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/index.html", server.uri())).unwrap();
        let response = fetcher.fetch(&FetchRequest::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"<html>");
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn test_http_fetcher_no_store_sends_bypass_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/script.js"))
            .and(header("cache-control", "no-cache"))
            .and(header("pragma", "no-cache"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpFetcherConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/script.js", server.uri())).unwrap();
        let request = FetchRequest::get(url).with_cache_mode(HttpCacheMode::NoStore);
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused() {
        let fetcher = HttpFetcher::new(HttpFetcherConfig::default()).unwrap();
        // Reserved port with nothing listening.
        let url = Url::parse("http://127.0.0.1:9/x").unwrap();
        let result = fetcher.fetch(&FetchRequest::get(url)).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
    }
}
