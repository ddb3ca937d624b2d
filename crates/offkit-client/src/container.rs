//! The service worker container.
//!
//! Owns registrations, runs worker lifecycles against the shared cache
//! store, tracks controlled pages, and broadcasts lifecycle events to
//! page-side observers.
//!
//! Lock order is registrations before clients, and neither lock is held
//! across a network await.

use crate::script::ScriptEvaluator;
use crate::{
    ClientError, Registration, RegistrationOptions, RegistrationSnapshot, ServiceWorkerState,
    UpdateViaCache, WorkerId, WorkerRecord,
};
use bytes::Bytes;
use hashbrown::HashMap;
use offkit_cache::CacheVersion;
use offkit_worker::{
    AppShell, Destination, FetchRequest, FetchResponse, HttpCacheMode, MessageOutcome,
    OfflineWorker, SharedFetcher, SharedStorage, WorkerConfig,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

// ==================== Events ====================

/// Lifecycle events broadcast to page-side observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A new worker version entered the installing slot.
    UpdateFound { scope: String },

    /// A worker changed state.
    StateChange {
        scope: String,
        worker: WorkerId,
        state: ServiceWorkerState,
    },

    /// A client's controlling worker changed.
    ControllerChange { client: ClientId },
}

/// Result of an update check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    /// Script bytes unchanged; nothing to do.
    Unchanged,
    /// A new version was found and its install flow ran.
    NewVersion,
}

// ==================== Clients ====================

/// Unique identifier for a connected page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A connected page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// The worker currently serving this page's requests.
    pub controller: Option<WorkerId>,
}

#[derive(Debug, Default)]
struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
}

impl ClientRegistry {
    fn connect(&mut self, url: Url) -> ClientId {
        let id = ClientId::new();
        self.clients.insert(
            id,
            Client {
                id,
                url,
                controller: None,
            },
        );
        id
    }

    fn disconnect(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    fn set_controller(&mut self, id: ClientId, worker: WorkerId) {
        if let Some(client) = self.clients.get_mut(&id) {
            client.controller = Some(worker);
        }
    }

    /// Point every in-scope client at `worker`; returns the clients whose
    /// controller actually changed.
    fn claim(&mut self, scope: &Url, worker: WorkerId) -> Vec<ClientId> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            let in_scope = client.url.as_str().starts_with(scope.as_str());
            if in_scope && client.controller != Some(worker) {
                client.controller = Some(worker);
                changed.push(client.id);
            }
        }
        changed
    }
}

// ==================== Container ====================

/// The service worker container: registrations, clients, events.
pub struct Container {
    registrations: RwLock<HashMap<String, Registration>>,
    clients: RwLock<ClientRegistry>,
    storage: SharedStorage,
    fetcher: SharedFetcher,
    evaluator: Arc<dyn ScriptEvaluator>,
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl Container {
    /// Create a container plus the receiving end of its event stream.
    pub fn new(
        storage: SharedStorage,
        fetcher: SharedFetcher,
        evaluator: Arc<dyn ScriptEvaluator>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                registrations: RwLock::new(HashMap::new()),
                clients: RwLock::new(ClientRegistry::default()),
                storage,
                fetcher,
                evaluator,
                event_tx,
            }),
            event_rx,
        )
    }

    /// The shared cache store this container's workers serve from.
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    fn emit(&self, event: ContainerEvent) {
        // Receiver may be gone in tests; events are advisory.
        let _ = self.event_tx.send(event);
    }

    // ==================== Clients ====================

    /// A page connected. It adopts the active in-scope worker as its
    /// controller, the way a freshly loaded page starts out controlled.
    pub async fn connect_client(&self, url: &Url) -> ClientId {
        let controller = {
            let regs = self.registrations.read().await;
            regs.values()
                .filter(|reg| url.as_str().starts_with(reg.scope.as_str()))
                .find_map(|reg| reg.active.as_ref().map(|record| record.id))
        };
        let mut clients = self.clients.write().await;
        let id = clients.connect(url.clone());
        if let Some(worker) = controller {
            clients.set_controller(id, worker);
        }
        id
    }

    /// A page went away.
    pub async fn disconnect_client(&self, id: ClientId) {
        self.clients.write().await.disconnect(id);
    }

    /// The page's current controller, if any.
    pub async fn controller_of(&self, id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.get(id).and_then(|c| c.controller)
    }

    /// Whether the page is controlled at all.
    pub async fn has_controller(&self, id: ClientId) -> bool {
        self.controller_of(id).await.is_some()
    }

    /// Route a page's request through its controlling worker. `None` means
    /// uncontrolled or not intercepted: use default networking.
    pub async fn handle_fetch(
        &self,
        client: ClientId,
        request: &FetchRequest,
    ) -> Option<FetchResponse> {
        let controller = self.controller_of(client).await?;
        let worker = self.worker_by_id(controller).await?;
        worker.handle_fetch(request).await
    }

    async fn worker_by_id(&self, id: WorkerId) -> Option<Arc<OfflineWorker>> {
        let regs = self.registrations.read().await;
        for reg in regs.values() {
            for slot in [&reg.active, &reg.waiting, &reg.installing] {
                if let Some(record) = slot {
                    if record.id == id {
                        return Some(record.worker.clone());
                    }
                }
            }
        }
        None
    }

    // ==================== Registration ====================

    /// Register a worker script. Fetches and evaluates the script, then runs
    /// the install flow unless the bytes match what is already registered.
    pub async fn register(
        &self,
        script_url: &Url,
        options: RegistrationOptions,
    ) -> Result<Url, ClientError> {
        let scope = resolve_scope(script_url, options.scope.as_ref())?;
        let script = self
            .fetch_script(script_url, options.update_via_cache)
            .await?;

        let unchanged = {
            let mut regs = self.registrations.write().await;
            let reg = regs.entry(scope.to_string()).or_insert_with(|| {
                Registration::new(scope.clone(), script_url.clone(), options.update_via_cache)
            });
            reg.script_url = script_url.clone();
            reg.update_via_cache = options.update_via_cache;
            reg.newest_script() == Some(&script)
        };

        if unchanged {
            debug!(scope = %scope, "registration unchanged, reusing existing worker");
            return Ok(scope);
        }

        let record = self.evaluate(script_url, &scope, script)?;
        info!(scope = %scope, script = %script_url, version = %record.version, "service worker registered");
        self.run_install(&scope, record).await;
        Ok(scope)
    }

    /// Re-fetch the script and install a new version when its bytes changed.
    pub async fn update(&self, scope: &Url) -> Result<UpdateCheck, ClientError> {
        let (script_url, update_via_cache) = {
            let mut regs = self.registrations.write().await;
            let reg = regs
                .get_mut(scope.as_str())
                .ok_or_else(|| ClientError::NotFound(scope.to_string()))?;
            reg.last_update_check = Some(Instant::now());
            (reg.script_url.clone(), reg.update_via_cache)
        };

        let script = self.fetch_script(&script_url, update_via_cache).await?;

        let unchanged = {
            let regs = self.registrations.read().await;
            let reg = regs
                .get(scope.as_str())
                .ok_or_else(|| ClientError::NotFound(scope.to_string()))?;
            reg.newest_script() == Some(&script)
        };
        if unchanged {
            debug!(scope = %scope, "update check: script unchanged");
            return Ok(UpdateCheck::Unchanged);
        }

        let record = self.evaluate(&script_url, scope, script)?;
        info!(scope = %scope, version = %record.version, "update check found a new version");
        self.run_install(scope, record).await;
        Ok(UpdateCheck::NewVersion)
    }

    /// Drop a registration, marking its workers redundant.
    pub async fn unregister(&self, scope: &Url) -> Result<bool, ClientError> {
        let removed = self.registrations.write().await.remove(scope.as_str());
        match removed {
            Some(mut reg) => {
                for slot in [&mut reg.installing, &mut reg.waiting, &mut reg.active] {
                    if let Some(record) = slot.take() {
                        self.emit(ContainerEvent::StateChange {
                            scope: scope.to_string(),
                            worker: record.id,
                            state: ServiceWorkerState::Redundant,
                        });
                    }
                }
                info!(scope = %scope, "service worker unregistered");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All registered scopes.
    pub async fn scopes(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// The scope whose registration covers `url`, if any.
    pub async fn registration_for(&self, url: &Url) -> Option<String> {
        let regs = self.registrations.read().await;
        regs.keys()
            .filter(|scope| url.as_str().starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// Observable snapshot of one registration.
    pub async fn snapshot(&self, scope: &Url) -> Option<RegistrationSnapshot> {
        self.registrations
            .read()
            .await
            .get(scope.as_str())
            .map(Registration::snapshot)
    }

    // ==================== Messages ====================

    /// Deliver a page message to the registration's most advanced
    /// non-active worker. Only the skip-waiting literal does anything.
    pub async fn post_message(
        &self,
        scope: &Url,
        payload: &str,
    ) -> Result<MessageOutcome, ClientError> {
        let recipient = {
            let regs = self.registrations.read().await;
            let reg = regs
                .get(scope.as_str())
                .ok_or_else(|| ClientError::NotFound(scope.to_string()))?;
            reg.waiting
                .as_ref()
                .or(reg.active.as_ref())
                .or(reg.installing.as_ref())
                .map(|record| record.worker.clone())
        };
        let Some(worker) = recipient else {
            return Ok(MessageOutcome::Ignored);
        };

        let outcome = worker.on_message(payload);
        if outcome == MessageOutcome::SkipWaiting {
            self.promote_waiting(scope).await;
        }
        Ok(outcome)
    }

    // ==================== Lifecycle ====================

    /// Install flow: installing → installed, then promotion when this is the
    /// first worker for the scope or the blueprint forces skip-waiting.
    async fn run_install(&self, scope: &Url, record: WorkerRecord) {
        let worker = record.worker.clone();
        let id = record.id;
        let skip_waiting = record.skip_waiting;

        {
            let mut regs = self.registrations.write().await;
            let Some(reg) = regs.get_mut(scope.as_str()) else {
                return;
            };
            let mut record = record;
            record.state = ServiceWorkerState::Installing;
            reg.installing = Some(record);
        }
        self.emit(ContainerEvent::UpdateFound {
            scope: scope.to_string(),
        });
        self.emit(ContainerEvent::StateChange {
            scope: scope.to_string(),
            worker: id,
            state: ServiceWorkerState::Installing,
        });

        // Precache is best-effort; the report is logged by the worker and a
        // partial shell still installs.
        let _report = worker.install().await;

        let first_install = {
            let mut regs = self.registrations.write().await;
            let Some(reg) = regs.get_mut(scope.as_str()) else {
                return;
            };
            if let Some(mut installed) = reg.installing.take() {
                installed.state = ServiceWorkerState::Installed;
                reg.waiting = Some(installed);
            }
            reg.active.is_none()
        };
        self.emit(ContainerEvent::StateChange {
            scope: scope.to_string(),
            worker: id,
            state: ServiceWorkerState::Installed,
        });

        // A first worker has nothing to wait for; a skip-waiting worker
        // refuses to wait even when an old version is still active.
        if first_install || skip_waiting {
            self.promote_waiting(scope).await;
        }
    }

    /// Promote the waiting worker: activate, collect stale caches, claim
    /// clients. Returns whether a promotion happened.
    pub async fn promote_waiting(&self, scope: &Url) -> bool {
        let (worker, id) = {
            let mut regs = self.registrations.write().await;
            let Some(reg) = regs.get_mut(scope.as_str()) else {
                return false;
            };
            let Some(mut record) = reg.waiting.take() else {
                return false;
            };
            record.state = ServiceWorkerState::Activating;
            if let Some(mut old) = reg.active.take() {
                old.state = ServiceWorkerState::Redundant;
                self.emit(ContainerEvent::StateChange {
                    scope: scope.to_string(),
                    worker: old.id,
                    state: ServiceWorkerState::Redundant,
                });
            }
            let worker = record.worker.clone();
            let id = record.id;
            reg.active = Some(record);
            (worker, id)
        };
        self.emit(ContainerEvent::StateChange {
            scope: scope.to_string(),
            worker: id,
            state: ServiceWorkerState::Activating,
        });

        // Cache GC; failures are reported, never blocking.
        let report = worker.activate().await;
        if !report.removed.is_empty() {
            debug!(scope = %scope, removed = ?report.removed, "stale caches collected");
        }

        {
            let mut regs = self.registrations.write().await;
            if let Some(reg) = regs.get_mut(scope.as_str()) {
                if let Some(active) = reg.active.as_mut() {
                    if active.id == id {
                        active.state = ServiceWorkerState::Activated;
                    }
                }
            }
        }
        self.emit(ContainerEvent::StateChange {
            scope: scope.to_string(),
            worker: id,
            state: ServiceWorkerState::Activated,
        });

        // Claim in-flight pages so the new worker serves them immediately.
        let changed = self.clients.write().await.claim(scope, id);
        for client in changed {
            self.emit(ContainerEvent::ControllerChange { client });
        }
        true
    }

    // ==================== Internals ====================

    async fn fetch_script(
        &self,
        script_url: &Url,
        mode: UpdateViaCache,
    ) -> Result<Bytes, ClientError> {
        let mut request =
            FetchRequest::get(script_url.clone()).with_destination(Destination::Script);
        if mode == UpdateViaCache::None {
            request = request.with_cache_mode(HttpCacheMode::NoStore);
        }
        let response = self.fetcher.fetch(&request).await?;
        if !response.is_ok_status() {
            return Err(ClientError::RegistrationFailed(format!(
                "script fetch for {script_url} returned {}",
                response.status
            )));
        }
        Ok(response.body)
    }

    fn evaluate(
        &self,
        script_url: &Url,
        scope: &Url,
        script: Bytes,
    ) -> Result<WorkerRecord, ClientError> {
        let blueprint = self.evaluator.evaluate(script_url, &script)?;
        let version = CacheVersion::new(&blueprint.version);
        let shell = AppShell::resolve(&blueprint.shell, scope, &version)?;
        let config = WorkerConfig {
            cache_prefix: blueprint.cache_prefix,
            version: version.clone(),
            scope: scope.clone(),
            script_url: script_url.clone(),
        };
        let worker = OfflineWorker::new(config, shell, self.storage.clone(), self.fetcher.clone());
        Ok(WorkerRecord {
            id: WorkerId::new(),
            script_url: script_url.clone(),
            script,
            version,
            skip_waiting: blueprint.skip_waiting,
            state: ServiceWorkerState::Parsed,
            worker: Arc::new(worker),
        })
    }
}

/// Derive or validate the registration scope: same origin as the script and
/// within the script's directory.
fn resolve_scope(script_url: &Url, requested: Option<&Url>) -> Result<Url, ClientError> {
    let directory = script_url
        .join("./")
        .map_err(|e| ClientError::InvalidScope(e.to_string()))?;
    match requested {
        None => Ok(directory),
        Some(scope) => {
            if scope.origin() != script_url.origin() {
                return Err(ClientError::InvalidScope(format!(
                    "scope {scope} is not same-origin with script {script_url}"
                )));
            }
            if !scope.path().starts_with(directory.path()) {
                warn!(scope = %scope, directory = %directory, "scope outside script directory");
                return Err(ClientError::InvalidScope(format!(
                    "scope {} is outside the script directory {}",
                    scope.path(),
                    directory.path()
                )));
            }
            Ok(scope.clone())
        }
    }
}
