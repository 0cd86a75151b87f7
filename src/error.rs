use std::net::SocketAddr;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevframeError {
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("DevTools is not ready after {attempts} attempt(s): {message}")]
    DiscoveryTimeout { attempts: u32, message: String },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, DevframeError>;
