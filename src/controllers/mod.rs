use thiserror::Error;

pub type ConfigGenerationResult<T> = std::result::Result<T, ConfigGenerationError>;

#[derive(Error, Debug)]
pub enum ConfigGenerationError {
    #[error("Bootstrap config parse error: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("Bootstrap config must be a YAML mapping, got {0}")]
    NotAMapping(&'static str),

    #[error("Bootstrap config serialize error: {0}")]
    Serialize(#[source] serde_yaml::Error),
}

pub type RemoteExecResult<T> = std::result::Result<T, RemoteExecError>;

#[derive(Error, Debug)]
pub enum RemoteExecError {
    #[error("Exec channel error: {0}")]
    Channel(#[from] kube::Error),

    #[error("Exec stream error: {0}")]
    Stream(#[from] std::io::Error),

    #[error("Exec stream `{0}` was not attached")]
    MissingStream(&'static str),

    #[error("`{command}` failed: {message}; stderr: {stderr}")]
    Failed {
        command: String,
        message: String,
        stderr: String,
    },

    #[error("`{path}` is not valid UTF-8")]
    Encoding { path: String },
}

pub mod client;
pub mod cluster;
pub mod controller;
pub mod credentials;
pub mod equivalence;
pub mod generator;
