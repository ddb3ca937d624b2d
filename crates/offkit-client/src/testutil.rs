//! Shared fixtures for container and coordinator tests.

use crate::script::WorkerBlueprint;
use async_trait::async_trait;
use hashbrown::HashMap;
use offkit_worker::{Fetch, FetchError, FetchRequest, FetchResponse};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// The canonical fixture script URL.
pub const SCRIPT: &str = "https://example.com/sw.json";

/// Serves a mutable in-memory site; flipping `offline` fails every fetch.
pub struct SiteFetcher {
    pages: Mutex<HashMap<String, String>>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl SiteFetcher {
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set(&self, url: &str, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for SiteFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network("offline".to_string()));
        }
        let mut key = request.url.clone();
        key.set_fragment(None);
        match self.pages.lock().unwrap().get(key.as_str()) {
            Some(body) => Ok(FetchResponse::ok(body.clone())),
            None => Ok(FetchResponse::empty(http::StatusCode::NOT_FOUND)),
        }
    }
}

/// Serialize the canonical blueprint with an explicit skip-waiting flag.
pub fn blueprint_json(version: &str, skip_waiting: bool) -> String {
    let mut blueprint = WorkerBlueprint::site_default(version);
    blueprint.skip_waiting = skip_waiting;
    serde_json::to_string(&blueprint).unwrap()
}

/// Publish one whole version of the fixture site.
pub fn seed_site(fetcher: &SiteFetcher, version: &str) {
    fetcher.set(SCRIPT, &blueprint_json(version, true));
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
