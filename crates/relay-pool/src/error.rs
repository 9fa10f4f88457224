//! Error taxonomy for relay operations.
//!
//! Most of these never escape the core: a failed connection just drops that
//! relay from the current operation, and a timed out query reads as an empty
//! result. Only the immediate caller of a publish or single lookup sees them.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The relay could not be reached or the socket died.
    #[error("failed to connect to {url}: {reason}")]
    Connection { url: String, reason: String },

    /// A deadline elapsed before enough results arrived.
    #[error("timed out")]
    Timeout,

    /// Every attempt of a race or broadcast failed.
    #[error("all {attempted} target(s) failed")]
    AllTargetsFailed { attempted: usize },

    /// The relay answered `OK` with `accepted = false`.
    #[error("{url} rejected the event: {reason}")]
    Rejected { url: String, reason: String },

    /// Unparseable content in something a relay handed us.
    #[error("malformed data: {0}")]
    Malformed(String),

    /// Lookup finished without finding anything.
    #[error("not found")]
    NotFound,

    /// The caller's context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The connection or loader task is gone.
    #[error("channel closed")]
    Closed,

    /// Persisted store failure. Callers treat this as a miss.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    pub fn connection(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
