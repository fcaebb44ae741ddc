//! Device errors

use thiserror::Error;

use crate::protocol::{CommandCode, ProtocolError};

/// Errors raised by the device session, the handshake and procedures
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Command {0} is not supported by this device")]
    UnsupportedCommand(CommandCode),

    #[error("Device refused '{request}': {answer}")]
    InvalidAnswer { request: String, answer: String },

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("A procedure is already running")]
    ProcedureAlreadyRunning,

    #[error("Procedure {0} is not supported by this device")]
    ProcedureUnsupported(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DeviceError {
    /// Whether the device link is gone
    pub fn is_connection_error(&self) -> bool {
        matches!(self, DeviceError::Protocol(e) if e.is_connection_error())
    }
}
