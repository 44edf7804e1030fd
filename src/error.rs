use std::time::Duration;
use thiserror::Error;

/// Failure to enumerate live matches. The whole discovery cycle is retried.
#[derive(Debug, Error)]
pub enum ListError {
    #[error("list request failed: {0}")]
    Request(String),
    #[error("list request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed match list: {0}")]
    Malformed(String),
}

/// Failure to obtain a fetcher. Counted against the worker's resource ceiling.
#[derive(Debug, Error)]
#[error("could not acquire fetcher: {0}")]
pub struct ResourceError(pub String);

/// Failure of a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Intrinsic to one attempt (timeout, not found, stale page). Retried in place.
    #[error("transient fetch error: {0}")]
    Transient(String),
    /// The underlying session is unusable and must be rebuilt.
    #[error("fatal fetcher error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Failure to write the snapshot file. Logged and retried next interval.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
