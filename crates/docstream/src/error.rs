//! Error types for docstream.
//!
//! Every failure that crosses the adapter boundary is one of four kinds.
//! Driver errors are normalized into [`Error::Connect`] or
//! [`Error::Operation`] depending on where they happened.

use thiserror::Error;

use crate::driver::DriverError;

/// Result type alias for docstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the pool, logical connections and cursors.
///
/// `Clone` because a single failed connect is delivered to every caller
/// that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Missing or invalid option. Raised synchronously, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver could not establish a client for an address.
    #[error("connect error: {0}")]
    Connect(String),

    /// The request was rejected before any connection was opened.
    #[error("validation error: {0}")]
    Validation(String),

    /// A save, remove or find failed after a successful connect.
    #[error("operation error: {0}")]
    Operation(String),
}

impl Error {
    pub(crate) fn connect(err: DriverError) -> Self {
        Error::Connect(err.message)
    }

    pub(crate) fn operation(err: DriverError) -> Self {
        Error::Operation(err.message)
    }

    /// Whether the message carries the transient connect-timeout signature.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connect(msg) | Error::Operation(msg) => crate::driver::is_transient_timeout(msg),
            _ => false,
        }
    }
}
