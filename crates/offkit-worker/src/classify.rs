//! Request classification.
//!
//! A pure, total function from an intercepted request to a routing decision.
//! Every same-origin GET lands in exactly one [`RequestClass`]; everything
//! the worker must not touch (non-GET, cross-origin non-image) is an explicit
//! [`RouteDecision::PassThrough`].

use crate::fetch::{Destination, FetchRequest, RequestMode};
use http::Method;
use url::{Origin, Url};

/// Image vs everything else within the static-asset class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Image,
    Other,
}

/// The closed set of interception categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    /// Top-level document navigation; must stay fresh and must never fail.
    Navigation,
    /// Script/style/manifest; stale copies are visibly broken.
    CriticalAsset,
    /// Decorative or data assets, split by kind.
    StaticAsset(AssetKind),
    /// The worker's own script; intercepting it would deadlock updates.
    Bypass,
}

/// Why a request is not intercepted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    NonGet,
    CrossOrigin,
}

/// The classifier's full verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Handle(RequestClass),
    PassThrough(PassReason),
}

/// Extensions that identify an image, same- or cross-origin.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "avif", "gif", "svg"];

/// Extensions whose staleness is visibly broken: code, style, manifest.
pub const CRITICAL_EXTENSIONS: &[&str] = &["js", "mjs", "css", "webmanifest"];

/// Classification context: the scope origin and the worker's own script path.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Origin,
    script_path: String,
}

impl Classifier {
    /// Build a classifier for a worker registered at `scope` running
    /// `script_url`.
    pub fn new(scope: &Url, script_url: &Url) -> Self {
        Self {
            origin: scope.origin(),
            script_path: normalize_path(script_url.path()),
        }
    }

    /// Whether a URL shares the worker's origin.
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin
    }

    /// Classify one request. Pure and deterministic.
    pub fn classify(&self, request: &FetchRequest) -> RouteDecision {
        use RouteDecision::{Handle, PassThrough};

        if request.method != Method::GET {
            return PassThrough(PassReason::NonGet);
        }

        let same_origin = self.is_same_origin(&request.url);

        if same_origin && normalize_path(request.url.path()) == self.script_path {
            return Handle(RequestClass::Bypass);
        }

        if !same_origin {
            // Opaque caching is allowed for images only.
            return if has_extension(&request.url, IMAGE_EXTENSIONS) {
                Handle(RequestClass::StaticAsset(AssetKind::Image))
            } else {
                PassThrough(PassReason::CrossOrigin)
            };
        }

        if request.mode == RequestMode::Navigate {
            return Handle(RequestClass::Navigation);
        }

        if is_critical(request) {
            return Handle(RequestClass::CriticalAsset);
        }

        if has_extension(&request.url, IMAGE_EXTENSIONS) {
            return Handle(RequestClass::StaticAsset(AssetKind::Image));
        }

        // Everything else same-origin: the balanced latency/freshness bucket.
        Handle(RequestClass::StaticAsset(AssetKind::Other))
    }
}

fn is_critical(request: &FetchRequest) -> bool {
    matches!(request.destination, Destination::Script | Destination::Style)
        || has_extension(&request.url, CRITICAL_EXTENSIONS)
}

/// Extension of the URL path, lowercased, query and fragment excluded.
fn extension(url: &Url) -> Option<String> {
    let path = url.path();
    let file = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

fn has_extension(url: &Url, set: &[&str]) -> bool {
    extension(url).is_some_and(|ext| set.contains(&ext.as_str()))
}

/// Lowercased path with any trailing slash removed, so `/sw.js` and
/// `/SW.js/` compare equal.
fn normalize_path(path: &str) -> String {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.to_ascii_lowercase()
}
