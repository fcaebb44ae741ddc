//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a sonicamp over its byte stream
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Device did not answer request '{request}' after {attempts} attempts")]
    Timeout { request: String, attempts: u32 },

    #[error("Not connected to device")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Buffer overflow: payload of {size} bytes exceeds {max}")]
    BufferOverflow { size: usize, max: usize },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the link itself is gone (as opposed to a bad frame)
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::SerialError(_)
                | ProtocolError::Timeout { .. }
                | ProtocolError::NotConnected
                | ProtocolError::ConnectionFailed(_)
                | ProtocolError::ConnectionLost(_)
                | ProtocolError::IoError(_)
        )
    }
}
