//! # OffKit Worker
//!
//! The offline worker: fetch interception, per-category strategies, and the
//! install/activate lifecycle over the versioned cache store.
//!
//! ## Features
//!
//! - **Classification**: pure, total mapping of requests to a closed class set
//! - **Strategies**: network-first, cache-first, stale-while-revalidate
//! - **Lifecycle**: best-effort precache at install, version GC at activate
//! - **Message channel**: the `skipWaiting` handover signal
//!
//! ## Architecture
//!
//! ```text
//! FetchRequest
//!     │
//!     ├── Classifier ── Bypass / PassThrough ──→ default networking
//!     │
//!     └── RequestClass
//!             ├── Navigation      → network-first + shell fallbacks
//!             ├── CriticalAsset   → network-first, HTTP cache bypassed
//!             ├── StaticAsset(Image) → cache-first
//!             └── StaticAsset(Other) → stale-while-revalidate
//!                     │
//!                     └── CacheStorage["<prefix>-v<version>"]
//! ```
//!
//! Every handler resolves: fallbacks end in synthetic 404/503/504 responses,
//! reports replace thrown errors, and a crashed path degrades to default
//! networking rather than a failed page.

use http::StatusCode;
use offkit_cache::CacheVersion;
use tracing::{debug, info, trace, warn};
use url::Url;

pub mod classify;
pub mod fetch;
pub mod lifecycle;
pub mod shell;
pub mod strategy;

#[cfg(test)]
mod testing;

pub use classify::{AssetKind, Classifier, PassReason, RequestClass, RouteDecision};
pub use fetch::{
    Destination, Fetch, FetchError, FetchRequest, FetchResponse, HttpCacheMode, HttpFetcher,
    HttpFetcherConfig, RequestMode, SharedFetcher,
};
pub use lifecycle::{ActivateReport, PrecacheFailure, PrecacheReport};
pub use shell::{AppShell, AppShellSpec, ShellError};
pub use strategy::{shared_storage, SharedStorage};

/// The one message payload the worker acts on.
pub const SKIP_WAITING: &str = "skipWaiting";

/// Verdict of the worker's message handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The waiting worker should activate immediately.
    SkipWaiting,
    /// Unknown payload; dropped without error.
    Ignored,
}

/// Static configuration for one deployed worker version.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Subsystem cache prefix; every version cache is `<prefix>-v<version>`.
    pub cache_prefix: String,
    /// This deploy's version tag.
    pub version: CacheVersion,
    /// Registration scope; shell entries resolve against it.
    pub scope: Url,
    /// The worker's own script URL, bypassed by the classifier.
    pub script_url: Url,
}

impl WorkerConfig {
    /// The version cache this worker reads and writes.
    pub fn cache_name(&self) -> String {
        offkit_cache::cache_name(&self.cache_prefix, &self.version)
    }
}

/// One deployed offline worker: classify, pick a strategy, serve.
pub struct OfflineWorker {
    config: WorkerConfig,
    shell: AppShell,
    classifier: Classifier,
    storage: SharedStorage,
    fetcher: SharedFetcher,
}

impl OfflineWorker {
    /// Assemble a worker over a shared store and fetcher.
    pub fn new(
        config: WorkerConfig,
        shell: AppShell,
        storage: SharedStorage,
        fetcher: SharedFetcher,
    ) -> Self {
        let classifier = Classifier::new(&config.scope, &config.script_url);
        Self {
            config,
            shell,
            classifier,
            storage,
            fetcher,
        }
    }

    /// This worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// This worker's resolved shell.
    pub fn shell(&self) -> &AppShell {
        &self.shell
    }

    /// The version cache this worker serves from.
    pub fn cache_name(&self) -> String {
        self.config.cache_name()
    }

    /// Install: precache the app shell, best-effort. Failures land in the
    /// report, never in an error.
    pub async fn install(&self) -> PrecacheReport {
        let cache = self.cache_name();
        let report =
            lifecycle::install(&self.storage, &cache, self.shell.urls(), &self.fetcher).await;
        if report.complete() {
            info!(cache = %report.cache, cached = report.cached, "worker installed");
        } else {
            warn!(
                cache = %report.cache,
                cached = report.cached,
                failed = report.failures.len(),
                "worker installed with partial shell"
            );
        }
        report
    }

    /// Activate: collect every stale sibling cache version.
    pub async fn activate(&self) -> ActivateReport {
        let report =
            lifecycle::activate(&self.storage, &self.config.cache_prefix, &self.cache_name())
                .await;
        info!(
            kept = %report.kept,
            removed = report.removed.len(),
            "worker activated"
        );
        report
    }

    /// Fetch interception. `None` means the request is not ours: forward it
    /// to default networking untouched.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Option<FetchResponse> {
        let cache = self.cache_name();
        match self.classifier.classify(request) {
            RouteDecision::PassThrough(reason) => {
                trace!(url = %request.url, ?reason, "not intercepted");
                None
            }
            RouteDecision::Handle(RequestClass::Bypass) => {
                trace!(url = %request.url, "own script, bypassing");
                None
            }
            RouteDecision::Handle(RequestClass::Navigation) => {
                Some(self.navigate(request, &cache).await)
            }
            RouteDecision::Handle(RequestClass::CriticalAsset) => {
                // Defeat intermediate HTTP caches unless the request already
                // does so itself, so redeploys of un-rehashed URLs are seen.
                let wire = if strategy::forces_network(request) {
                    None
                } else {
                    Some(strategy::with_no_store(request))
                };
                let response = strategy::network_first(
                    request,
                    &self.storage,
                    &cache,
                    &self.fetcher,
                    wire.as_ref(),
                )
                .await;
                Some(response.unwrap_or_else(|| FetchResponse::empty(StatusCode::GATEWAY_TIMEOUT)))
            }
            RouteDecision::Handle(RequestClass::StaticAsset(AssetKind::Image)) => {
                Some(self.image(request, &cache).await)
            }
            RouteDecision::Handle(RequestClass::StaticAsset(AssetKind::Other)) => {
                let response =
                    strategy::stale_while_revalidate(request, &self.storage, &cache, &self.fetcher)
                        .await;
                Some(response.unwrap_or_else(|| FetchResponse::empty(StatusCode::GATEWAY_TIMEOUT)))
            }
        }
    }

    /// Navigation chain: network, cached response, root document, offline
    /// page, synthetic 503. Never errors.
    async fn navigate(&self, request: &FetchRequest, cache: &str) -> FetchResponse {
        if let Some(response) =
            strategy::network_first(request, &self.storage, cache, &self.fetcher, None).await
        {
            return response;
        }

        debug!(url = %request.url, "offline navigation, serving shell");
        let guard = self.storage.read().await;
        if let Some(store) = guard.get(cache) {
            if let Some(entry) = store.match_url(self.shell.root_document()) {
                return FetchResponse::from_entry(entry);
            }
            if let Some(page) = self.shell.offline_page() {
                if let Some(entry) = store.match_url(page) {
                    return FetchResponse::from_entry(entry);
                }
            }
        }
        FetchResponse::offline_placeholder()
    }

    /// Images: cache-first; cross-origin ones get one plain pass-through
    /// attempt before giving up with a 404.
    async fn image(&self, request: &FetchRequest, cache: &str) -> FetchResponse {
        if let Some(response) =
            strategy::cache_first(request, &self.storage, cache, &self.fetcher).await
        {
            return response;
        }
        if !self.classifier.is_same_origin(&request.url) {
            if let Ok(response) = self.fetcher.fetch(request).await {
                return response;
            }
        }
        FetchResponse::empty(StatusCode::NOT_FOUND)
    }

    /// Message channel. Only the skip-waiting literal means anything; every
    /// other payload is dropped without error.
    pub fn on_message(&self, payload: &str) -> MessageOutcome {
        if payload == SKIP_WAITING {
            MessageOutcome::SkipWaiting
        } else {
            debug!(payload, "ignoring unknown worker message");
            MessageOutcome::Ignored
        }
    }
}
