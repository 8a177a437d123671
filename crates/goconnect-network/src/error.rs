//! Network layer errors

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// UDP socket could not be bound
    #[error("bind error: {0}")]
    Bind(String),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Interface loopback self-test returned different bytes
    #[error("loopback payload mismatch")]
    LoopbackMismatch,

    /// Frame exceeds the u16 length prefix
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Transport is not running
    #[error("transport not started")]
    NotStarted,

    /// Outbound enqueue did not complete in time
    #[error("send timed out")]
    SendTimeout,

    /// Transport was stopped while a receive was pending
    #[error("transport stopped")]
    Stopped,

    /// Session establishment failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed wire data
    #[error("protocol error: {0}")]
    Protocol(String),

    /// STUN probe timed out
    #[error("STUN request timed out")]
    StunTimeout,

    /// Identity or trust material problem
    #[error(transparent)]
    Identity(#[from] goconnect_identity::IdentityError),

    /// TLS configuration error
    #[error("TLS config error: {0}")]
    Tls(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
