//! Configuration error types

use std::path::PathBuf;

use tessera_types::RosterError;
use thiserror::Error;

/// Everything that can make a configuration unusable. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to render configuration as TOML: {0}")]
    RenderError(#[from] toml::ser::Error),

    #[error("Invalid address for {id}: {address}")]
    InvalidAddress { id: String, address: String },

    #[error("Invalid key for {id}: {reason}")]
    InvalidKey { id: String, reason: String },

    #[error("Invalid roster: {0}")]
    InvalidRoster(#[from] RosterError),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Unknown node id: {0}")]
    UnknownNode(String),

    #[error("XDG directory error: {0}")]
    XdgError(String),
}
