//! Store error types.
//!
//! Only misuse of the API and unrecoverable startup conditions are errors.
//! Validation problems and failed writes are reported as result values
//! (`ValidationResult`, `WriteOutcome`).

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while constructing or using a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The schema descriptor could not be compiled.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The store options are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A data operation was called before `init` completed.
    #[error("settings store is not initialized")]
    Uninitialized,

    /// A key argument was empty or otherwise malformed.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// The settings directory could not be created.
    #[error("failed to create settings directory {path}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings document failed validation and repair is disabled.
    #[error("settings document failed validation: {}", .0.join("; "))]
    InvalidDocument(Vec<String>),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The owner link is closed.
    #[error("owner link disconnected")]
    Disconnected,

    /// The owner reported an error for a request.
    #[error("owner error: {0}")]
    Remote(String),

    /// The owner answered with a response of the wrong kind.
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    /// An operation needed a tokio runtime and none was running, such as
    /// `init_sync` with file watching enabled.
    #[error("no tokio runtime available")]
    NoRuntime,
}
