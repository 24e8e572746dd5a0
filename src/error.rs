//! Error types for the token authority

use std::io;

use thiserror::Error;

use crate::keys::KeyError;

/// Result type alias for the token authority
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level errors (startup, configuration, CLI commands)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key lifecycle error
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// Persistence error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the key and authorization stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A persisted row could not be decoded.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt {
        /// Row identifier (file name or key).
        id: String,
        /// Decoder message.
        reason: String,
    },

    /// Underlying IO failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Backend refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
