//! Error types for Tollgate.

use std::time::Duration;

use thiserror::Error;

/// Invalid limiter parameters. These are programming errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    #[error("capacity must be > 0")]
    ZeroCapacity,

    #[error("window must be > 0")]
    ZeroWindow,
}

/// Failures talking to the shared state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached or rejected the handshake
    #[error("store unreachable at {addr}: {reason}")]
    Connection { addr: String, reason: String },

    /// Network fault during a call
    #[error("store I/O error: {0}")]
    Io(String),

    /// Unexpected reply shape or protocol violation
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// The atomic procedure failed to evaluate
    #[error("procedure evaluation failed: {0}")]
    Procedure(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            return StoreError::Io(err.to_string());
        }
        match err.kind() {
            redis::ErrorKind::ResponseError | redis::ErrorKind::NoScriptError => {
                StoreError::Procedure(err.to_string())
            }
            _ => StoreError::Protocol(err.to_string()),
        }
    }
}

/// Errors surfaced by a limiter decision.
///
/// A denial is `Ok(false)`, never an error.
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("decision canceled before the store responded")]
    Canceled,

    #[error("store did not respond within {0:?}")]
    Timeout(Duration),
}

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid limiter parameters
    #[error("Limiter construction error: {0}")]
    Construction(#[from] ConstructionError),

    /// Store connectivity errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Decision errors
    #[error("Limiter error: {0}")]
    Limiter(#[from] LimiterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
