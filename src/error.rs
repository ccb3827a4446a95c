//! Crate-level error type.
//!
//! Component-local failures have their own enums ([`crate::state::NotFound`],
//! [`crate::push::PushError`], [`crate::gateway::ExecError`]) and are absorbed
//! at their component boundary. `BridgeError` covers the failures that are
//! allowed to stop the process: bad configuration and an unusable listener.

use std::path::PathBuf;

/// Errors surfaced to `main`.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// A configuration value could not be interpreted.
    #[error("invalid configuration value for {key}: {detail}")]
    Config { key: String, detail: String },

    /// The TOML configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML configuration file is not valid TOML or has the wrong shape.
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
