//! Error types shared across the scraping core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Resource pool exhausted: all {size} resources busy after waiting {waited:?}")]
    PoolExhausted { size: usize, waited: Duration },

    #[error("Resource pool is closed")]
    PoolClosed,

    #[error("Failed to create pool resource #{index}: {source}")]
    PoolStart {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("{target}: all {attempts} attempts failed, last error: {last_error}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    /// Non-retryable failure of a job's operation.
    #[error("{target}: {message}")]
    Operation { target: String, message: String },

    /// Failure of a job's operation that may succeed if attempted again.
    #[error("{target}: {message} (transient)")]
    Transient { target: String, message: String },

    #[error("Corrupt cache entry {key_hash}: {reason}")]
    CacheCorrupt { key_hash: String, reason: String },

    #[error("No snapshot found for subject: {subject}")]
    SnapshotNotFound { subject: String },

    #[error("Invalid subject id '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Invalid profile URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error for {key}: {message}")]
    Config { key: String, message: String },

    #[error("Webhook delivery to {url} failed: {message}")]
    Webhook { url: String, message: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether the retry executor should attempt the failing operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Io { .. })
    }

    /// Whether re-issuing the same job later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::RetriesExhausted { .. }
                | Error::Transient { .. }
                | Error::Webhook { .. }
        )
    }
}
