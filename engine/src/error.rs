//! Error types for the tether engine.

use crate::StoreId;
use thiserror::Error;

/// All possible errors from the tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Argument errors
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("expected an object")]
    ExpectedObject,

    // Server errors, mapped from transport status codes
    #[error("server responded 401: unauthorized")]
    ServerUnauthorized,

    #[error("server responded 403: forbidden")]
    ServerForbidden,

    #[error("server responded 405: method not allowed")]
    ServerInvalidMethod,

    #[error("server error: status {0}")]
    ServerError(u16),

    // Transport errors
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    // State errors
    #[error("a mutation of key '{0}' is already in flight")]
    ConcurrentMutation(String),

    #[error("store not found: {0}")]
    StoreNotFound(StoreId),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidArguments`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArguments(reason.into())
    }

    /// True for errors mapped from a server status code.
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Error::ServerUnauthorized
                | Error::ServerForbidden
                | Error::ServerInvalidMethod
                | Error::ServerError(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
