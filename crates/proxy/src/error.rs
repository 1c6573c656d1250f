use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy is not fully configured: missing {0}")]
    NotConfigured(&'static str),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load TLS material: {0}")]
    Tls(String),

    #[error("invalid backend address: {0}")]
    InvalidBackend(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("random generator unavailable: {0}")]
    Rng(String),

    #[error("http client error: {0}")]
    HttpClient(String),

    #[error("proxy {0} is already running")]
    AlreadyRunning(String),

    #[error("another proxy is currently being created")]
    CreationInProgress,

    #[error("proxy {0} is not running")]
    NotRunning(String),

    #[error("proxy {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("proxy {name} did not become healthy within {timeout:?}")]
    StartupCheckTimeout { name: String, timeout: Duration },

    #[error("proxy {0} did not shut down within the configured timeout")]
    ShutdownTimeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
