//! Worker script evaluation.
//!
//! In this engine the worker "script" is a declarative JSON blueprint:
//! version tag, cache prefix, shell manifest, and whether the worker forces
//! activation at install. Fetched bytes are evaluated into a
//! [`WorkerBlueprint`]; update checks compare the raw bytes, so any edit to
//! the blueprint counts as a new version.

use crate::ClientError;
use bytes::Bytes;
use offkit_worker::AppShellSpec;
use serde::{Deserialize, Serialize};
use url::Url;

/// Everything one deploy of the worker declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBlueprint {
    /// Subsystem cache prefix shared by every version of this worker.
    pub cache_prefix: String,

    /// Version tag, one per deploy.
    pub version: String,

    /// Force activation at install instead of parking in the waiting slot.
    #[serde(default)]
    pub skip_waiting: bool,

    /// App-shell manifest to precache.
    pub shell: AppShellSpec,
}

impl WorkerBlueprint {
    /// The canonical portfolio-site blueprint.
    pub fn site_default(version: &str) -> Self {
        Self {
            cache_prefix: "site".to_string(),
            version: version.to_string(),
            skip_waiting: true,
            shell: AppShellSpec::site_default(),
        }
    }
}

/// Turns fetched script bytes into a blueprint.
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate a script body. Errors fail the registration.
    fn evaluate(&self, script_url: &Url, body: &Bytes) -> Result<WorkerBlueprint, ClientError>;
}

/// The JSON blueprint evaluator.
#[derive(Debug, Default, Clone)]
pub struct JsonEvaluator;

impl ScriptEvaluator for JsonEvaluator {
    fn evaluate(&self, script_url: &Url, body: &Bytes) -> Result<WorkerBlueprint, ClientError> {
        serde_json::from_slice(body).map_err(|err| {
            ClientError::ScriptError(format!("{script_url}: {err}"))
        })
    }
}
