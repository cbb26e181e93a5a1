//! Error types for the realtime gate.

/// Top-level error type for the realtime session client.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Wire protocol encode/decode error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport (WebSocket) connection error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Realtime token minting error.
    #[error("token error: {0}")]
    Token(String),

    /// Session lifecycle error (illegal state transition).
    #[error("session error: {0}")]
    Session(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GateError>;
