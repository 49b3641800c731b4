use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced by the core event-driven pipeline.
///
/// Every fallible path in `shardproxy-core` returns one of these instead of
/// asserting or aborting; the event loop decides what to do with it (close a
/// connection, synthesize a client reply, or just log).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("permission denied for command {0:?}")]
    PermissionDenied(String),

    #[error("quota exceeded for pool {0:?}")]
    QuotaExceeded(String),

    #[error("backend {addr} connect/io error: {source}")]
    BackendIo {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("backend request timed out after {0}ms")]
    BackendTimeout(u64),

    #[error("no live backend available for pool {0:?}")]
    NoLiveBackend(String),

    #[error("memcached protocol is not supported by this proxy")]
    MemcacheUnsupported,

    #[error("client not authenticated")]
    NotAuthenticated,

    #[error("client outstanding pipeline too deep")]
    PipelineOverflow,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while loading/validating a [`crate::config::ProxyConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path:?}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("pool {pool:?}: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("pool {pool:?}: invalid value for {field:?}: {value:?}")]
    InvalidValue {
        pool: String,
        field: &'static str,
        value: String,
    },

    #[error("pool {pool:?}: malformed backend line {line:?}: {reason}")]
    MalformedBackend {
        pool: String,
        line: String,
        reason: String,
    },

    #[error("no pools configured")]
    NoPools,
}

pub type CoreResult<T> = Result<T, CoreError>;
