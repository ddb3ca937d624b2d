//! # OffKit Client
//!
//! Page-side coordination for the OffKit offline worker: the registration
//! container that owns worker lifecycles, and the update coordinator that
//! polls for new versions and orchestrates safe page reloads.
//!
//! ## Architecture
//!
//! ```text
//! UpdateCoordinator (page context)
//!     │  register / poll / skipWaiting
//!     ▼
//! Container
//!     ├── Registration (per scope)
//!     │       ├── installing (WorkerRecord)
//!     │       ├── waiting
//!     │       └── active ──→ OfflineWorker ──→ CacheStorage
//!     └── ClientRegistry (controlled pages)
//!             │
//!             └── events: UpdateFound / StateChange / ControllerChange
//! ```
//!
//! Only `Active` is a safe resting state for a tab; the coordinator drives
//! every other state toward it and latches the one reload that completes a
//! version handover.

use bytes::Bytes;
use offkit_cache::CacheVersion;
use offkit_worker::{FetchError, OfflineWorker, ShellError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use url::Url;

pub mod container;
pub mod coordinator;
pub mod script;

#[cfg(test)]
pub(crate) mod testutil;

pub use container::{Client, ClientId, Container, ContainerEvent, UpdateCheck};
pub use coordinator::{
    CoordinatorConfig, CoordinatorPhase, ReloadLatch, RevalidateTrigger, UpdateCoordinator,
};
pub use script::{JsonEvaluator, ScriptEvaluator, WorkerBlueprint};

// ==================== Errors ====================

/// Errors surfacing from registration and update operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Script fetch failed: {0}")]
    ScriptFetch(#[from] FetchError),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Shell error: {0}")]
    Shell(#[from] ShellError),

    #[error("No registration for scope: {0}")]
    NotFound(String),
}

// ==================== Worker records ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Script fetched and evaluated, not yet installing.
    #[default]
    Parsed,
    /// Install (precache) in progress.
    Installing,
    /// Installed, parked in the waiting slot.
    Installed,
    /// Activate (GC + claim) in progress.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced or failed.
    Redundant,
}

/// One evaluated worker version held by a registration.
#[derive(Clone)]
pub struct WorkerRecord {
    /// Unique ID.
    pub id: WorkerId,

    /// Script URL the worker was built from.
    pub script_url: Url,

    /// Raw script bytes; updates are detected by byte comparison.
    pub script: Bytes,

    /// Deploy version carried by the blueprint.
    pub version: CacheVersion,

    /// Whether the worker forces activation at install.
    pub skip_waiting: bool,

    /// Current state.
    pub state: ServiceWorkerState,

    /// The executable worker.
    pub worker: Arc<OfflineWorker>,
}

impl WorkerRecord {
    /// Snapshot for observers.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            state: self.state,
            version: self.version.clone(),
        }
    }
}

/// Observable slice of a worker record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub state: ServiceWorkerState,
    pub version: CacheVersion,
}

// ==================== Registration ====================

/// How the script fetch interacts with intermediate HTTP caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateViaCache {
    #[default]
    Imports,
    All,
    None,
}

/// Options for [`Container::register`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Explicit scope; derived from the script directory when absent.
    pub scope: Option<Url>,

    /// HTTP-cache mode for the script fetch itself.
    pub update_via_cache: UpdateViaCache,
}

/// A service worker registration: one scope, up to three worker slots.
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Script URL re-fetched on update checks.
    pub script_url: Url,

    /// HTTP-cache mode for script fetches.
    pub update_via_cache: UpdateViaCache,

    /// Worker being installed.
    pub installing: Option<WorkerRecord>,

    /// Installed worker waiting for activation.
    pub waiting: Option<WorkerRecord>,

    /// Active worker.
    pub active: Option<WorkerRecord>,

    /// When an update check last ran.
    pub last_update_check: Option<Instant>,
}

impl Registration {
    /// Create an empty registration.
    pub fn new(scope: Url, script_url: Url, update_via_cache: UpdateViaCache) -> Self {
        Self {
            scope,
            script_url,
            update_via_cache,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// The newest known script bytes, used for update byte-comparison.
    pub fn newest_script(&self) -> Option<&Bytes> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
            .map(|record| &record.script)
    }

    /// Observable snapshot of all three slots.
    pub fn snapshot(&self) -> RegistrationSnapshot {
        RegistrationSnapshot {
            scope: self.scope.clone(),
            installing: self.installing.as_ref().map(WorkerRecord::status),
            waiting: self.waiting.as_ref().map(WorkerRecord::status),
            active: self.active.as_ref().map(WorkerRecord::status),
        }
    }
}

/// Observable slice of a registration.
#[derive(Debug, Clone)]
pub struct RegistrationSnapshot {
    pub scope: Url,
    pub installing: Option<WorkerStatus>,
    pub waiting: Option<WorkerStatus>,
    pub active: Option<WorkerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(WorkerId::new(), WorkerId::new());
    }

    #[test]
    fn test_state_default_is_parsed() {
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
    }

    #[test]
    fn test_registration_newest_script_priority() {
        let scope = Url::parse("https://example.com/").unwrap();
        let script_url = Url::parse("https://example.com/sw.js").unwrap();
        let mut registration =
            Registration::new(scope, script_url, UpdateViaCache::None);
        assert!(registration.newest_script().is_none());
        assert!(registration.snapshot().active.is_none());
        registration.last_update_check = Some(Instant::now());
        assert!(registration.last_update_check.is_some());
    }
}
