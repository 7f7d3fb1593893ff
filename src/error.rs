//! Error types for the build-cache helper

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a cache session
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with the path that triggered it
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Index record could not be parsed
    #[error("malformed index record {path}: {reason}")]
    IndexParse { path: PathBuf, reason: String },

    /// Object body length disagreed with the recorded size
    #[error("object size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Remote object-store operation failed
    #[error("remote {op} failed: {message}")]
    Remote { op: &'static str, message: String },

    /// Clear attempted on a read-only backend
    #[error("clear blocked: backend is in read-only mode")]
    ReadOnly,

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Advisory lock file could not be opened or locked
    #[error("lock file {path}: {source}")]
    LockFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON encoding or decoding error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Error produced by the winning caller of a deduplicated operation
    #[error("{0}")]
    Dedupe(Arc<Error>),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Unwrap a shared error back into an owned one where possible.
    /// Waiters of a single-flight call all receive the same error; the last
    /// reference recovers the original value, the others carry it as
    /// [`Error::Dedupe`].
    pub(crate) fn shared(err: Arc<Error>) -> Error {
        match Arc::try_unwrap(err) {
            Ok(err) => err,
            Err(err) => Error::Dedupe(err),
        }
    }
}
