//! Install and activate lifecycle.
//!
//! Both phases are best-effort: a partially populated shell still installs,
//! and garbage collection never blocks activation. Each phase returns a
//! typed report the caller decides to log, retry, or discard.

use crate::fetch::{FetchError, FetchRequest, SharedFetcher};
use crate::strategy::SharedStorage;
use tracing::debug;
use url::Url;

/// One shell resource that could not be precached.
#[derive(Debug, Clone)]
pub struct PrecacheFailure {
    pub url: Url,
    pub error: FetchError,
}

/// Outcome of the install phase.
#[derive(Debug, Clone)]
pub struct PrecacheReport {
    /// The version cache that was populated.
    pub cache: String,
    /// How many shell URLs were attempted.
    pub attempted: usize,
    /// How many snapshots landed.
    pub cached: usize,
    /// Per-resource failures, all non-fatal.
    pub failures: Vec<PrecacheFailure>,
}

impl PrecacheReport {
    /// Whether the whole shell made it into the cache.
    pub fn complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of the activate phase's garbage collection.
#[derive(Debug, Clone)]
pub struct ActivateReport {
    /// The surviving cache name.
    pub kept: String,
    /// Stale sibling caches that were deleted.
    pub removed: Vec<String>,
}

/// Install: open the version cache (idempotent) and precache the shell.
/// A single-resource failure never fails the install.
pub async fn install(
    storage: &SharedStorage,
    cache: &str,
    shell_urls: &[Url],
    fetcher: &SharedFetcher,
) -> PrecacheReport {
    // The cache must exist even if every fetch below fails.
    storage.write().await.open(cache);

    let mut report = PrecacheReport {
        cache: cache.to_string(),
        attempted: shell_urls.len(),
        cached: 0,
        failures: Vec::new(),
    };

    for url in shell_urls {
        let request = FetchRequest::get(url.clone());
        match fetcher.fetch(&request).await {
            Ok(response) if response.is_ok_status() => {
                let entry = response.to_entry(url);
                let mut guard = storage.write().await;
                match guard.open(cache).put(entry) {
                    Ok(()) => report.cached += 1,
                    Err(err) => {
                        debug!(url = %url, error = %err, "precache store rejected snapshot");
                        report.failures.push(PrecacheFailure {
                            url: url.clone(),
                            error: FetchError::InvalidRequest(err.to_string()),
                        });
                    }
                }
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status, "precache got non-200");
                report.failures.push(PrecacheFailure {
                    url: url.clone(),
                    error: FetchError::UnexpectedStatus(response.status.as_u16()),
                });
            }
            Err(err) => {
                debug!(url = %url, error = %err, "precache fetch failed");
                report.failures.push(PrecacheFailure {
                    url: url.clone(),
                    error: err,
                });
            }
        }
    }

    report
}

/// Activate: delete every cache sharing the prefix except the current one.
pub async fn activate(storage: &SharedStorage, prefix: &str, current: &str) -> ActivateReport {
    let removed = storage
        .write()
        .await
        .remove_stale_versions(prefix, current);
    ActivateReport {
        kept: current.to_string(),
        removed,
    }
}
