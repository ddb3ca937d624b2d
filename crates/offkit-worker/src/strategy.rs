//! Fetch/cache strategies.
//!
//! Each strategy takes the intercepted request, a shared cache handle, and a
//! fetcher, and resolves to `Some(response)` or `None` (nothing to serve).
//! Lock scopes cover a single store operation, so concurrent fetch events
//! interleave freely and entry operations stay independently atomic.

use crate::fetch::{FetchRequest, FetchResponse, HttpCacheMode, SharedFetcher};
use offkit_cache::CacheStorage;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Shared handle to the cache storage. Opening a cache by name is idempotent,
/// so every fetch event may hold its own clone of this handle.
pub type SharedStorage = Arc<RwLock<CacheStorage>>;

/// Create an empty shared store.
pub fn shared_storage() -> SharedStorage {
    Arc::new(RwLock::new(CacheStorage::new()))
}

/// Read a snapshot for `url` out of the named cache.
pub async fn read_cached(
    storage: &SharedStorage,
    cache: &str,
    url: &Url,
) -> Option<FetchResponse> {
    let guard = storage.read().await;
    guard
        .get(cache)
        .and_then(|c| c.match_url(url))
        .map(FetchResponse::from_entry)
}

/// Write-through a response when, and only when, it is a 200.
async fn store_if_ok(
    storage: &SharedStorage,
    cache: &str,
    url: &Url,
    response: &FetchResponse,
) {
    if !response.is_ok_status() {
        return;
    }
    let entry = response.to_entry(url);
    let mut guard = storage.write().await;
    if let Err(err) = guard.open(cache).put(entry) {
        debug!(url = %url, error = %err, "snapshot rejected by cache store");
    }
}

/// Network first: await the live network, write a 200 through, and return the
/// network response whatever its status; fall back to the cached snapshot
/// only when the transport itself fails.
///
/// `fetch_request` overrides what goes on the wire (the cache is still keyed
/// by `request`); used to force cache-bypassing fetches for critical assets.
pub async fn network_first(
    request: &FetchRequest,
    storage: &SharedStorage,
    cache: &str,
    fetcher: &SharedFetcher,
    fetch_request: Option<&FetchRequest>,
) -> Option<FetchResponse> {
    let wire = fetch_request.unwrap_or(request);
    match fetcher.fetch(wire).await {
        Ok(response) => {
            store_if_ok(storage, cache, &request.url, &response).await;
            Some(response)
        }
        Err(err) => {
            debug!(url = %request.url, error = %err, "network-first falling back to cache");
            read_cached(storage, cache, &request.url).await
        }
    }
}

/// Cache first: a hit is returned immediately, without awaiting any network
/// future; a detached background refresh keeps the snapshot from going stale
/// forever. A miss falls through to the network.
pub async fn cache_first(
    request: &FetchRequest,
    storage: &SharedStorage,
    cache: &str,
    fetcher: &SharedFetcher,
) -> Option<FetchResponse> {
    if let Some(hit) = read_cached(storage, cache, &request.url).await {
        spawn_refresh(request.clone(), storage.clone(), cache.to_string(), fetcher.clone());
        return Some(hit);
    }

    match fetcher.fetch(request).await {
        Ok(response) => {
            store_if_ok(storage, cache, &request.url, &response).await;
            Some(response)
        }
        Err(err) => {
            debug!(url = %request.url, error = %err, "cache-first miss and network failed");
            None
        }
    }
}

/// Stale while revalidate: return the cached snapshot immediately when
/// present while a concurrent fetch refreshes the store; without a snapshot,
/// await that in-flight fetch.
pub async fn stale_while_revalidate(
    request: &FetchRequest,
    storage: &SharedStorage,
    cache: &str,
    fetcher: &SharedFetcher,
) -> Option<FetchResponse> {
    let cached = read_cached(storage, cache, &request.url).await;

    let revalidation = {
        let request = request.clone();
        let storage = storage.clone();
        let cache = cache.to_string();
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) => {
                    store_if_ok(&storage, &cache, &request.url, &response).await;
                    Some(response)
                }
                Err(err) => {
                    debug!(url = %request.url, error = %err, "revalidation failed");
                    None
                }
            }
        })
    };

    if let Some(hit) = cached {
        // The revalidation task keeps running detached.
        return Some(hit);
    }
    revalidation.await.ok().flatten()
}

/// Fire-and-forget refresh of one snapshot.
fn spawn_refresh(
    request: FetchRequest,
    storage: SharedStorage,
    cache: String,
    fetcher: SharedFetcher,
) {
    tokio::spawn(async move {
        match fetcher.fetch(&request).await {
            Ok(response) => store_if_ok(&storage, &cache, &request.url, &response).await,
            Err(err) => {
                debug!(url = %request.url, error = %err, "background refresh failed");
            }
        }
    });
}

/// Whether the incoming request already defeats HTTP caches on its own.
pub fn forces_network(request: &FetchRequest) -> bool {
    if matches!(
        request.cache_mode,
        HttpCacheMode::NoStore | HttpCacheMode::Reload
    ) {
        return true;
    }
    request
        .cache_control()
        .map(|cc| {
            let cc = cc.to_ascii_lowercase();
            cc.contains("no-cache") || cc.contains("no-store") || cc.contains("max-age=0")
        })
        .unwrap_or(false)
}

/// Rebuild the request with a cache-bypassing mode for the wire fetch.
pub fn with_no_store(request: &FetchRequest) -> FetchRequest {
    request.clone().with_cache_mode(HttpCacheMode::NoStore)
}
