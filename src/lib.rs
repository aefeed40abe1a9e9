use clients::IamError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("IAM Role Error: {0}")]
    IamRoleError(#[from] IamError),

    #[error("Failed to render rolePolicyTemplate: {0}")]
    PolicyRenderError(#[from] minijinja::Error),

    #[error("Cloud provider {0:?} is not supported, only \"aws\" is")]
    UnsupportedCloudProvider(String),

    #[error("Object is missing its {0}")]
    MissingObjectKey(&'static str),

    #[error("Kubernetes {operation} did not complete in time")]
    Timeout { operation: &'static str },

    #[error("The CloudServiceAccount CRD is not installed in the cluster")]
    CrdNotInstalled,

    #[error("Watch failed with {}: {}", .0.reason, .0.message)]
    WatchError(kube::error::ErrorResponse),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::IamRoleError(e) => e.metric_label(),
            Error::PolicyRenderError(_) => "PolicyRenderError",
            Error::UnsupportedCloudProvider(_) => "UnsupportedCloudProvider",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::Timeout { .. } => "Timeout",
            Error::CrdNotInstalled => "CrdNotInstalled",
            Error::WatchError(_) => "WatchError",
        }
    }
}

/// Kubernetes and IAM API clients
pub mod clients;

pub mod controllers;
pub use controllers::{cloudserviceaccount::run, Settings, State};

/// Content hashing for change detection
pub mod digest;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// CRDs
pub mod resources;
