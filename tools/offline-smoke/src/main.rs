//! Offline smoke harness for the OffKit stack.
//!
//! Replays the two scenarios that matter end to end against an in-memory
//! site: surviving offline navigation from the precached shell, and the
//! v1 → v2 deploy handover with its single page reload.
//!
//! ## Usage
//!
//! ```bash
//! # Run both scenarios and print a JSON summary
//! offline-smoke all
//!
//! # Individually
//! offline-smoke offline
//! offline-smoke update --verbose
//! ```

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use offkit_client::{
    Container, CoordinatorConfig, JsonEvaluator, RevalidateTrigger, UpdateCoordinator,
    WorkerBlueprint,
};
use offkit_common::{init_logging, LogConfig};
use offkit_worker::{shared_storage, Fetch, FetchError, FetchRequest, FetchResponse};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use url::Url;

const SCRIPT: &str = "https://example.com/sw.json";

#[derive(Parser)]
#[command(name = "offline-smoke")]
#[command(about = "Scripted offline-cache and update-handover scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache a site, go offline, navigate from the shell
    Offline,
    /// Deploy v2 over v1 and observe the handover reload
    Update,
    /// Run every scenario
    All,
}

/// In-memory origin server with an offline switch.
struct DemoFetcher {
    pages: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
}

impl DemoFetcher {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
        }
    }

    fn set(&self, url: &str, body: &str) {
        self.pages
            .lock()
            .expect("page map lock poisoned")
            .insert(url.to_string(), body.to_string());
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetch for DemoFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("offline".to_string()));
        }
        let pages = self.pages.lock().expect("page map lock poisoned");
        match pages.get(request.url.as_str()) {
            Some(body) => Ok(FetchResponse::ok(body.clone())),
            None => Ok(FetchResponse::empty(http::StatusCode::NOT_FOUND)),
        }
    }
}

/// Publish one whole deploy of the demo site.
fn deploy(fetcher: &DemoFetcher, version: &str) {
    let blueprint = WorkerBlueprint::site_default(version);
    fetcher.set(
        SCRIPT,
        &serde_json::to_string(&blueprint).expect("blueprint serializes"),
    );
    fetcher.set("https://example.com/", "<root>");
    fetcher.set(
        "https://example.com/index.html",
        &format!("<index v{version}>"),
    );
    fetcher.set("https://example.com/404.html", "<404>");
    fetcher.set(
        &format!("https://example.com/styles.css?v={version}"),
        &format!("css v{version}"),
    );
    fetcher.set(&format!("https://example.com/script.js?v={version}"), "js");
    fetcher.set(
        &format!("https://example.com/manifest.webmanifest?v={version}"),
        "{}",
    );
    fetcher.set("https://example.com/robots.txt", "robots");
    fetcher.set("https://example.com/sitemap.xml", "<xml/>");
    fetcher.set("https://example.com/assets/favicon.svg", "<svg/>");
    fetcher.set("https://example.com/assets/images/og-image.jpg", "og");
    fetcher.set("https://example.com/assets/images/profile.jpg", "p1");
    fetcher.set("https://example.com/assets/images/profile@2x.jpg", "p2");
}

struct Harness {
    fetcher: Arc<DemoFetcher>,
    container: Arc<Container>,
    session: Arc<UpdateCoordinator>,
    page: offkit_client::ClientId,
    reloads: Arc<AtomicUsize>,
}

async fn bring_up() -> Harness {
    let fetcher = Arc::new(DemoFetcher::new());
    deploy(&fetcher, "1");

    let (container, events) =
        Container::new(shared_storage(), fetcher.clone(), Arc::new(JsonEvaluator));
    let page = container
        .connect_client(&Url::parse("https://example.com/").expect("valid url"))
        .await;

    let reloads = Arc::new(AtomicUsize::new(0));
    let session = {
        let reloads = reloads.clone();
        Arc::new(UpdateCoordinator::new(
            container.clone(),
            page,
            CoordinatorConfig::new(Url::parse(SCRIPT).expect("valid url")),
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
            },
        ))
    };
    tokio::spawn(session.clone().run(events));

    session.start().await.expect("registration succeeds");
    // Let the detached event loop settle.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        fetcher,
        container,
        session,
        page,
        reloads,
    }
}

async fn site_caches(container: &Container) -> Vec<String> {
    let guard = container.storage().read().await;
    let mut names: Vec<String> = guard
        .keys()
        .into_iter()
        .filter(|name| offkit_cache::shares_prefix(name, "site"))
        .map(|name| name.to_string())
        .collect();
    names.sort();
    names
}

async fn offline_scenario() -> serde_json::Value {
    info!("offline scenario: precache, drop the network, navigate");
    let harness = bring_up().await;

    let caches = site_caches(&harness.container).await;

    harness.fetcher.set_offline(true);
    let navigation = harness
        .container
        .handle_fetch(
            harness.page,
            &FetchRequest::navigation(Url::parse("https://example.com/projects").expect("valid url")),
        )
        .await;

    let (status, body) = match &navigation {
        Some(response) => (
            response.status.as_u16(),
            String::from_utf8_lossy(&response.body).into_owned(),
        ),
        None => (0, String::new()),
    };

    json!({
        "scenario": "offline",
        "caches": caches,
        "offline_navigation_status": status,
        "offline_navigation_body": body,
        "served_from_cache": navigation.map(|r| r.from_cache).unwrap_or(false),
    })
}

async fn update_scenario() -> serde_json::Value {
    info!("update scenario: deploy v2, observe the handover");
    let harness = bring_up().await;
    let reloads_before = harness.reloads.load(Ordering::SeqCst);
    let caches_before = site_caches(&harness.container).await;

    deploy(&harness.fetcher, "2");
    harness.session.poll(RevalidateTrigger::Online).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let caches_after = site_caches(&harness.container).await;

    harness.fetcher.set_offline(true);
    let navigation = harness
        .container
        .handle_fetch(
            harness.page,
            &FetchRequest::navigation(
                Url::parse("https://example.com/projects").expect("valid url"),
            ),
        )
        .await;

    json!({
        "scenario": "update",
        "caches_before": caches_before,
        "caches_after": caches_after,
        "handover_reloads": harness.reloads.load(Ordering::SeqCst) - reloads_before,
        "offline_body_after_update": navigation
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .unwrap_or_default(),
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = if cli.verbose {
        LogConfig::debug().with_filter("offkit=debug,offline_smoke=debug")
    } else {
        LogConfig::default()
    };
    init_logging(config);

    let mut results = Vec::new();
    match cli.command {
        Commands::Offline => results.push(offline_scenario().await),
        Commands::Update => results.push(update_scenario().await),
        Commands::All => {
            results.push(offline_scenario().await);
            results.push(update_scenario().await);
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "results": results }))
            .expect("summary serializes")
    );
}
