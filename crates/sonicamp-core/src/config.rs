//! Session configuration
//!
//! All durations are given in milliseconds. Every field has a default, so a
//! partial JSON file only overrides what it names.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{FrameProtocol, DEFAULT_ATTEMPTS, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Errors while loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Communicator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    /// Framing spoken by the device
    pub protocol: FrameProtocol,
    /// Baud rate used when opening
    pub baud_rate: u32,
    /// Timeout of a single request attempt
    pub request_timeout_ms: u64,
    /// Attempts before the link is declared dead
    pub max_attempts: u32,
    /// Requests are written in chunks of this many bytes
    pub write_chunk_size: usize,
    /// Pause between two chunks of one request
    pub write_chunk_delay_ms: u64,
    /// Capacity of the raw message ring
    pub message_queue_size: usize,
    /// Total time spent reading the legacy banner
    pub handshake_budget_ms: u64,
    /// Silence after which a multi-line answer is considered complete
    pub handshake_line_timeout_ms: u64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            protocol: FrameProtocol::Framed,
            baud_rate: DEFAULT_BAUD_RATE,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_attempts: DEFAULT_ATTEMPTS,
            write_chunk_size: 30,
            write_chunk_delay_ms: 1000,
            message_queue_size: 100,
            handshake_budget_ms: 6000,
            handshake_line_timeout_ms: 300,
            event_capacity: 256,
        }
    }
}

impl CommunicatorConfig {
    /// Time to wait for one answer
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Pause between written chunks
    pub fn write_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.write_chunk_delay_ms)
    }

    /// Total time allowed for the handshake
    pub fn handshake_budget(&self) -> Duration {
        Duration::from_millis(self.handshake_budget_ms)
    }

    /// Quiet period that ends a legacy banner
    pub fn line_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_line_timeout_ms)
    }
}

/// Device session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Period of the auto-updater
    pub update_interval_ms: u64,
    /// Period at which remote procedures poll the status
    pub procedure_poll_interval_ms: u64,
    /// Build type assumed when the device does not report one
    pub is_release_default: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 300,
            procedure_poll_interval_ms: 200,
            is_release_default: true,
        }
    }
}

impl DeviceConfig {
    /// Period of the status updater
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Period of the remote procedure poll
    pub fn procedure_poll_interval(&self) -> Duration {
        Duration::from_millis(self.procedure_poll_interval_ms)
    }
}

/// Complete configuration of one device session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Link and framing settings
    pub communicator: CommunicatorConfig,
    /// Device session settings
    pub device: DeviceConfig,
}

impl SessionConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a JSON configuration string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}
