use std::path::PathBuf;

use thiserror::Error;

/// Problems reading or validating the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures reported by a [`crate::transport::Connection`] or while opening one.
#[derive(Debug, Error)]
pub enum TransportError {
    #[cfg(feature = "io")]
    #[error(transparent)]
    Http(#[from] crate::http::HttpError),

    /// The gateway rejected the bot token (close code 4004).
    #[error("authentication rejected by the gateway")]
    AuthenticationFailed,

    /// The gateway closed the session with a code that must not be retried.
    #[error("gateway closed the session (code {code}): {reason}")]
    Fatal { code: u16, reason: String },

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("connection is closed")]
    Closed,
}

/// Errors that abort [`crate::bot::Runtime::start`]. No partial runtime is
/// ever returned alongside one of these.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("shard {index}/{count} failed to open: {source}")]
    ShardOpen {
        index: u32,
        count: u32,
        #[source]
        source: TransportError,
    },

    #[error("command keyword `{0}` registered twice")]
    DuplicateCommand(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Startup(#[from] StartupError),
}

pub type Result<T> = std::result::Result<T, Error>;
