//! The page-side update coordinator.
//!
//! Registers the worker once, watches lifecycle events, messages a freshly
//! installed worker to skip waiting when this page is already controlled,
//! latches the single reload that completes a handover, and throttles
//! revalidation triggers down to one real update check per interval.

use crate::container::{ClientId, Container, ContainerEvent};
use crate::{RegistrationOptions, ServiceWorkerState, UpdateViaCache};
use offkit_common::Throttle;
use offkit_worker::SKIP_WAITING;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Floor between two real update checks, however many triggers fire.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Period of the standing revalidation timer.
pub const POLL_TIMER_PERIOD: Duration = Duration::from_secs(30 * 60);

/// Page-side configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Worker script URL to register.
    pub script_url: Url,
    /// Explicit registration scope; derived from the script when absent.
    pub scope: Option<Url>,
    /// Update-check throttle floor.
    pub min_poll_interval: Duration,
    /// Standing revalidation timer period.
    pub poll_timer_period: Duration,
}

impl CoordinatorConfig {
    /// Defaults for a script URL: derived scope, 15 s floor, 30 min timer.
    pub fn new(script_url: Url) -> Self {
        Self {
            script_url,
            scope: None,
            min_poll_interval: MIN_POLL_INTERVAL,
            poll_timer_period: POLL_TIMER_PERIOD,
        }
    }

    /// Request an explicit scope.
    pub fn with_scope(mut self, scope: Url) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// The events that ask for an update re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidateTrigger {
    /// Connectivity came back.
    Online,
    /// The window took focus.
    Focus,
    /// The page became visible.
    VisibilityVisible,
    /// The standing timer fired.
    Timer,
}

/// One-shot reload guard: however often the controller changes, the page
/// reloads once.
#[derive(Debug, Default)]
pub struct ReloadLatch {
    fired: AtomicBool,
}

impl ReloadLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once.
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Where a tab stands in the update machine. Only `Active` is restful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    NoRegistration,
    Installing,
    WaitingToActivate,
    Active,
    ReloadPending,
}

/// Drives one page's registration, update polling, and reload.
pub struct UpdateCoordinator {
    container: Arc<Container>,
    client: ClientId,
    config: CoordinatorConfig,
    scope: RwLock<Option<Url>>,
    throttle: Mutex<Throttle>,
    latch: ReloadLatch,
    reload: Box<dyn Fn() + Send + Sync>,
}

impl UpdateCoordinator {
    /// Build a coordinator for one connected page. `reload` is invoked at
    /// most once, when a new worker takes over this page.
    pub fn new(
        container: Arc<Container>,
        client: ClientId,
        config: CoordinatorConfig,
        reload: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let throttle = Throttle::new(config.min_poll_interval);
        Self {
            container,
            client,
            config,
            scope: RwLock::new(None),
            throttle: Mutex::new(throttle),
            latch: ReloadLatch::new(),
            reload: Box::new(reload),
        }
    }

    /// The page this coordinator belongs to.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Register the worker. A failure of the fully-optioned call falls back
    /// to a bare registration; a second failure degrades the page to plain
    /// online-only behavior and is not an error.
    pub async fn start(&self) -> Option<Url> {
        let options = RegistrationOptions {
            scope: self.config.scope.clone(),
            update_via_cache: UpdateViaCache::None,
        };
        let scope = match self.container.register(&self.config.script_url, options).await {
            Ok(scope) => Some(scope),
            Err(err) => {
                warn!(error = %err, "optioned registration failed, retrying bare");
                match self
                    .container
                    .register(&self.config.script_url, RegistrationOptions::default())
                    .await
                {
                    Ok(scope) => Some(scope),
                    Err(err) => {
                        warn!(error = %err, "registration failed, degrading to online-only");
                        None
                    }
                }
            }
        };
        if let Some(scope) = &scope {
            info!(scope = %scope, "worker registration established");
        }
        *self.scope.write().await = scope.clone();
        scope
    }

    /// React to one container event.
    pub async fn on_event(&self, event: &ContainerEvent) {
        match event {
            ContainerEvent::UpdateFound { scope } => {
                if self.is_our_scope(scope).await {
                    debug!(scope, "new worker version found");
                }
            }
            ContainerEvent::StateChange { scope, state, .. } => {
                if *state == ServiceWorkerState::Installed && self.is_our_scope(scope).await {
                    // A controlled page seeing a fresh install means a
                    // version handover: tell the waiting worker to go.
                    if self.container.has_controller(self.client).await {
                        self.send_skip_waiting().await;
                    }
                }
            }
            ContainerEvent::ControllerChange { client } => {
                if *client == self.client {
                    if self.latch.fire() {
                        info!("controller changed, reloading page");
                        (self.reload)();
                    } else {
                        trace!("reload already pending, ignoring controller change");
                    }
                }
            }
        }
    }

    /// Consume the container's event stream until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ContainerEvent>) {
        while let Some(event) = events.recv().await {
            self.on_event(&event).await;
        }
        debug!("event stream closed, coordinator stopping");
    }

    /// Handle a revalidation trigger. Returns whether an actual update check
    /// ran (the throttle may swallow it).
    pub async fn poll(&self, trigger: RevalidateTrigger) -> bool {
        let Some(scope) = self.scope.read().await.clone() else {
            trace!(?trigger, "no registration to poll");
            return false;
        };
        if !self.throttle.lock().await.try_fire() {
            trace!(?trigger, "update check throttled");
            return false;
        }
        debug!(?trigger, "checking for a worker update");
        match self.container.update(&scope).await {
            Ok(check) => trace!(?check, "update check finished"),
            Err(err) => warn!(error = %err, "update check failed"),
        }
        true
    }

    /// Spawn the standing revalidation timer.
    pub fn spawn_poll_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.config.poll_timer_period);
            // Swallow the immediate first tick; polling starts one period out.
            interval.tick().await;
            loop {
                interval.tick().await;
                coordinator.poll(RevalidateTrigger::Timer).await;
            }
        })
    }

    /// Where this tab currently stands.
    pub async fn phase(&self) -> CoordinatorPhase {
        if self.latch.has_fired() {
            return CoordinatorPhase::ReloadPending;
        }
        let Some(scope) = self.scope.read().await.clone() else {
            return CoordinatorPhase::NoRegistration;
        };
        match self.container.snapshot(&scope).await {
            Some(snapshot) => {
                if snapshot.installing.is_some() {
                    CoordinatorPhase::Installing
                } else if snapshot.waiting.is_some() {
                    CoordinatorPhase::WaitingToActivate
                } else if snapshot.active.is_some() {
                    CoordinatorPhase::Active
                } else {
                    CoordinatorPhase::NoRegistration
                }
            }
            None => CoordinatorPhase::NoRegistration,
        }
    }

    async fn is_our_scope(&self, scope: &str) -> bool {
        self.scope
            .read()
            .await
            .as_ref()
            .is_some_and(|ours| ours.as_str() == scope)
    }

    async fn send_skip_waiting(&self) {
        let scope = self.scope.read().await.clone();
        if let Some(scope) = scope {
            if let Err(err) = self.container.post_message(&scope, SKIP_WAITING).await {
                warn!(error = %err, "failed to deliver skip-waiting message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::JsonEvaluator;
    use crate::testutil::{blueprint_json, seed_site, SiteFetcher, SCRIPT};
    use offkit_cache::CacheVersion;
    use offkit_worker::shared_storage;
    use std::sync::atomic::AtomicUsize;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct Harness {
        container: Arc<Container>,
        events: mpsc::UnboundedReceiver<ContainerEvent>,
        fetcher: Arc<SiteFetcher>,
        reloads: Arc<AtomicUsize>,
    }

    impl Harness {
        async fn new() -> Self {
            let fetcher = Arc::new(SiteFetcher::new());
            seed_site(&fetcher, "1");
            let (container, events) =
                Container::new(shared_storage(), fetcher.clone(), Arc::new(JsonEvaluator));
            Self {
                container,
                events,
                fetcher,
                reloads: Arc::new(AtomicUsize::new(0)),
            }
        }

        async fn coordinator(&self, client: ClientId) -> UpdateCoordinator {
            let reloads = self.reloads.clone();
            UpdateCoordinator::new(
                self.container.clone(),
                client,
                CoordinatorConfig::new(url(SCRIPT)),
                move || {
                    reloads.fetch_add(1, Ordering::SeqCst);
                },
            )
        }

        /// Feed every queued event (and any it causes) to the coordinator.
        async fn drain_into(&mut self, coordinator: &UpdateCoordinator) {
            while let Ok(event) = self.events.try_recv() {
                coordinator.on_event(&event).await;
            }
        }

        fn discard_events(&mut self) {
            while self.events.try_recv().is_ok() {}
        }

        fn reloads(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_reload_latch_fires_exactly_once() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let coordinator = harness.coordinator(page).await;

        for _ in 0..5 {
            coordinator
                .on_event(&ContainerEvent::ControllerChange { client: page })
                .await;
        }
        assert_eq!(harness.reloads(), 1);
        assert_eq!(coordinator.phase().await, CoordinatorPhase::ReloadPending);
    }

    #[tokio::test]
    async fn test_foreign_controller_change_is_ignored() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let other = harness
            .container
            .connect_client(&url("https://example.com/other"))
            .await;
        let coordinator = harness.coordinator(page).await;

        coordinator
            .on_event(&ContainerEvent::ControllerChange { client: other })
            .await;
        assert_eq!(harness.reloads(), 0);
    }

    #[tokio::test]
    async fn test_start_registers_and_reaches_active() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let coordinator = harness.coordinator(page).await;

        let scope = coordinator.start().await.unwrap();
        assert_eq!(scope.as_str(), "https://example.com/");
        assert_eq!(coordinator.phase().await, CoordinatorPhase::Active);
    }

    #[tokio::test]
    async fn test_start_falls_back_to_bare_registration() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let reloads = harness.reloads.clone();
        let coordinator = UpdateCoordinator::new(
            harness.container.clone(),
            page,
            // A cross-origin scope makes the optioned call fail.
            CoordinatorConfig::new(url(SCRIPT)).with_scope(url("https://evil.example.net/")),
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
            },
        );

        let scope = coordinator.start().await.unwrap();
        assert_eq!(scope.as_str(), "https://example.com/");
    }

    #[tokio::test]
    async fn test_start_degrades_when_registration_is_impossible() {
        let harness = Harness::new().await;
        harness.fetcher.set_offline(true);
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let coordinator = harness.coordinator(page).await;

        assert!(coordinator.start().await.is_none());
        assert_eq!(coordinator.phase().await, CoordinatorPhase::NoRegistration);
        assert_eq!(harness.reloads(), 0);
    }

    #[tokio::test]
    async fn test_poll_throttles_bursts_to_one_update_call() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let coordinator = harness.coordinator(page).await;
        coordinator.start().await.unwrap();

        let baseline = harness.fetcher.calls();
        let triggers = [
            RevalidateTrigger::Online,
            RevalidateTrigger::Focus,
            RevalidateTrigger::VisibilityVisible,
            RevalidateTrigger::Focus,
            RevalidateTrigger::Timer,
        ];
        let mut performed = 0;
        for trigger in triggers {
            if coordinator.poll(trigger).await {
                performed += 1;
            }
        }

        assert_eq!(performed, 1);
        // Exactly one script re-fetch hit the network.
        assert_eq!(harness.fetcher.calls(), baseline + 1);
    }

    #[tokio::test]
    async fn test_poll_without_registration_is_a_noop() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let coordinator = harness.coordinator(page).await;
        assert!(!coordinator.poll(RevalidateTrigger::Online).await);
    }

    #[tokio::test]
    async fn test_installed_with_controller_sends_skip_waiting() {
        let mut harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;

        // First page load: v1 registers and claims the page.
        let first_session = harness.coordinator(page).await;
        let scope = first_session.start().await.unwrap();
        harness.discard_events();

        // The page reloaded: new coordinator, same client, fresh latch.
        let coordinator = harness.coordinator(page).await;
        coordinator.start().await.unwrap();
        harness.discard_events();

        // v2 deploys without skip-waiting of its own.
        seed_site(&harness.fetcher, "2");
        harness.fetcher.set(SCRIPT, &blueprint_json("2", false));
        assert!(coordinator.poll(RevalidateTrigger::Online).await);

        // Installed but parked: the coordinator must message it through.
        assert_eq!(
            coordinator.phase().await,
            CoordinatorPhase::WaitingToActivate
        );
        harness.drain_into(&coordinator).await;

        let snapshot = harness.container.snapshot(&scope).await.unwrap();
        assert_eq!(
            snapshot.active.unwrap().version,
            CacheVersion::new("2")
        );
        assert_eq!(harness.reloads(), 1);
        assert_eq!(coordinator.phase().await, CoordinatorPhase::ReloadPending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timer_fires_after_period() {
        let harness = Harness::new().await;
        let page = harness
            .container
            .connect_client(&url("https://example.com/"))
            .await;
        let reloads = harness.reloads.clone();
        let coordinator = Arc::new(UpdateCoordinator::new(
            harness.container.clone(),
            page,
            CoordinatorConfig::new(url(SCRIPT)),
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
            },
        ));
        coordinator.start().await.unwrap();
        let baseline = harness.fetcher.calls();

        let timer = coordinator.spawn_poll_timer();
        // Short of the period: nothing happens.
        tokio::time::sleep(Duration::from_secs(29 * 60)).await;
        assert_eq!(harness.fetcher.calls(), baseline);
        // Past it: exactly one scripted update check.
        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        tokio::task::yield_now().await;
        assert_eq!(harness.fetcher.calls(), baseline + 1);

        timer.abort();
    }
}
