//! Error types for the migration core.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration core.
#[derive(Error, Debug)]
pub enum Error {
    /// Source service (legacy KVS) errors.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Destination state store errors.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A persisted metadata value failed to parse. This is corruption
    /// and is never retried.
    #[error("metadata corruption at key {key}: {reason}")]
    Corruption { key: String, reason: String },

    /// The destination rejected a record during apply.
    #[error("apply failed at sequence number {seq_num}: {reason}")]
    Apply { seq_num: i64, reason: String },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from the source service HTTP surface.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Connection failed (refused, reset, unreachable partition).
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The source returned a server-side error status.
    #[error("server error from {endpoint}: status {status}")]
    ServerError { endpoint: String, status: u16 },

    /// The source rejected the request (4xx). Never retried.
    #[error("request rejected by {endpoint}: status {status}: {body}")]
    Rejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The request timed out.
    #[error("request to {endpoint} timed out")]
    RequestTimeout { endpoint: String },

    /// The response body was not in the expected shape.
    #[error("invalid response body from {endpoint}: {reason}")]
    InvalidBody { endpoint: String, reason: String },

    /// The enumeration stream broke mid-flight.
    #[error("enumeration stream failed: {0}")]
    Stream(String),
}

/// Errors from the destination transactional store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The per-operation lease expired before the operation finished.
    #[error("store lease expired")]
    LeaseExpired,

    /// Key not found where one was required.
    #[error("metadata key not found: {0}")]
    NotFound(String),

    /// The transaction could not commit and may be retried.
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    /// Store-side timeout.
    #[error("store operation timed out")]
    Timeout,

    /// Underlying store I/O failure.
    #[error("store io error: {0}")]
    Io(String),
}

impl Error {
    /// Whether the configured retry policy applies to this error.
    ///
    /// Transient I/O is retried where it surfaces; corruption, apply
    /// failures, source rejections and cancellation propagate
    /// unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Source(e) => matches!(
                e,
                SourceError::ConnectionFailed { .. }
                    | SourceError::ServerError { .. }
                    | SourceError::RequestTimeout { .. }
                    | SourceError::Stream(_)
            ),
            Error::Store(e) => matches!(
                e,
                StoreError::LeaseExpired | StoreError::CommitFailed(_) | StoreError::Timeout
            ),
            Error::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Source(SourceError::ServerError {
            endpoint: "GetEndSN".into(),
            status: 503,
        })
        .is_transient());
        assert!(Error::Store(StoreError::LeaseExpired).is_transient());
        assert!(Error::Timeout.is_transient());

        assert!(!Error::Source(SourceError::Rejected {
            endpoint: "EnumerateKeys".into(),
            status: 400,
            body: "bad range".into(),
        })
        .is_transient());
        assert!(!Error::Corruption {
            key: "MigrationStartSeqNum".into(),
            reason: "not a number".into(),
        }
        .is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Apply {
            seq_num: 42,
            reason: "record too large".into(),
        }
        .is_transient());
    }
}
