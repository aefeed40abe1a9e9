use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Metrics;

pub mod cloudserviceaccount;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    /// The watch cursor the current session started from
    pub resource_version: Option<String>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            resource_version: None,
        }
    }
}

/// Cluster facts and tunables used by every reconciliation
#[derive(Clone, Debug)]
pub struct Settings {
    /// Prefix of every managed role name
    pub cluster_name: String,
    pub account_id: String,
    /// Without the https:// scheme
    pub oidc_issuer: String,
    /// Upper bound on every IAM and Kubernetes call
    pub api_timeout: Duration,
    /// Delay before the supervisor restarts a failed watcher
    pub restart_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            account_id: String::new(),
            oidc_issuer: String::new(),
            api_timeout: Duration::from_secs(30),
            restart_backoff: Duration::from_secs(5),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the watcher
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    pub settings: Settings,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            settings,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Register metrics with our registry
    pub fn register_metrics(&self) -> Result<Metrics, prometheus::Error> {
        Metrics::new()?.register(&self.registry)
    }
}
