//! Core errors

use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity error
    #[error(transparent)]
    Identity(#[from] goconnect_identity::IdentityError),

    /// Network error
    #[error(transparent)]
    Network(#[from] goconnect_network::NetworkError),

    /// Forwarder tasks did not finish within the shutdown timeout
    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    /// Operation requires a running agent
    #[error("agent is not running")]
    NotRunning,
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
