//! Error types shared by the registry and the center runtime.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised while building, encoding or decoding a key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A required key level was not provided.
    #[error("Missing key segment: {0}")]
    MissingSegment(&'static str),

    /// A key level was provided but is empty.
    #[error("Empty key segment: {0}")]
    EmptySegment(&'static str),

    /// A key level contains a character reserved by the physical layouts.
    #[error("Key segment {field} contains a reserved character: {value:?}")]
    ReservedCharacter { field: &'static str, value: String },

    /// A narrower level was set without the level above it.
    #[error("Key segment {field} requires {requires} to be set")]
    MissingParent {
        field: &'static str,
        requires: &'static str,
    },

    /// An encoded key could not be parsed.
    #[error("Malformed key {0:?}")]
    Malformed(String),
}

/// Errors surfaced synchronously to callers of the configuration center.
#[derive(Debug, Error)]
pub enum MconfError {
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Configuration already exists: {0}")]
    Conflict(String),

    #[error("Configuration not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The stored payload does not decode into the requested type.
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration center is closed")]
    Closed,
}

pub type Result<T, E = MconfError> = std::result::Result<T, E>;
