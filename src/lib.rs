use controllers::{ConfigGenerationError, RemoteExecError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{kind} `{name}` request error: {source}")]
    Request {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("{kind} `{name}` was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Config generation error: {0}")]
    ConfigGeneration(#[from] ConfigGenerationError),

    #[error("Remote exec error: {0}")]
    RemoteExec(#[from] RemoteExecError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Attach resource context to an object store error.
    ///
    /// HTTP 409 responses are split into `AlreadyExists` (create) and
    /// `Conflict` (stale resourceVersion on update).
    pub fn request(kind: impl Into<String>, name: impl Into<String>, source: kube::Error) -> Self {
        let (kind, name) = (kind.into(), name.into());
        match &source {
            kube::Error::Api(response) if response.code == 409 => {
                if response.reason == "AlreadyExists" {
                    Error::AlreadyExists { kind, name }
                } else {
                    Error::Conflict { kind, name }
                }
            }
            _ => Error::Request { kind, name, source },
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kubeerror",
            Error::Request { .. } => "request",
            Error::Conflict { .. } => "conflict",
            Error::AlreadyExists { .. } => "alreadyexists",
            Error::ConfigGeneration(_) => "configgeneration",
            Error::RemoteExec(_) => "remoteexec",
            Error::Serialization(_) => "serialization",
        }
        .to_string()
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod api;
pub mod controllers;
pub mod predicates;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::{Diagnostics, Metrics};
