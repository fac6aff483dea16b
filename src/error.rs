use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`StoreClient`](crate::StoreClient) operations.
///
/// A missing key is never an error; absence is reported as `None` or `false`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The transport cannot serve requests (refused, dropped, I/O failure).
    /// Retry after a `ConnectionRestored` event.
    #[error("connection error: {0}")]
    Connection(String),

    /// Connecting or the health check did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The key holds a value of a different type than the operation expects.
    #[error("WRONGTYPE operation against key '{key}' holding the wrong kind of value")]
    TypeMismatch { key: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Any other error reply from the server.
    #[error("command failed: {0}")]
    Command(String),
}

impl StoreError {
    /// Transport-class failures: these mark the connection as down.
    pub fn is_transport(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidConfig(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
