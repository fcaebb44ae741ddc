//! # sonicamp Core Library
//!
//! Device communication and control runtime for sonicamp ultrasonic
//! amplifiers.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Framed and legacy packet codecs over any async byte stream
//! - A request/response communicator with retries and baud rate changes
//! - A versioned command/answer registry with typed answer validation
//! - A device session tracking amplifier status, with an optional poller
//! - Cancellable procedures (ramp, scan, tune, auto, wipe)
//! - A small scripting language and its interpreter
//! - A simulated device for demos and tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sonicamp_core::prelude::*;
//!
//! let communicator = Arc::new(Communicator::new(CommunicatorConfig::default()));
//! communicator
//!     .open_communication(Arc::new(SerialConnectionFactory::new("/dev/ttyUSB0")), 9600)
//!     .await?;
//! let device = DeviceBuilder::new().build(communicator).await?;
//!
//! device.set_frequency(1_000_000).await?;
//! device.set_signal_on().await?;
//! println!("urms: {:?}", device.status().snapshot().urms());
//! ```

pub mod config;
pub mod demo;
pub mod device;
pub mod events;
pub mod procedures;
pub mod protocol;
pub mod scripting;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{CommunicatorConfig, DeviceConfig, SessionConfig};
    pub use crate::demo::{DemoConnectionFactory, DemoSonicamp};
    pub use crate::device::{DeviceBuilder, DeviceError, Info, SonicDevice, Status};
    pub use crate::events::{Event, EventBus};
    pub use crate::procedures::{
        HoldDuration, ProcedureArgs, ProcedureController, ProcedureType, RampArgs,
    };
    pub use crate::protocol::{
        Answer, Command, CommandCode, Communicator, ConnectionFactory, DeviceType, Field,
        FrameProtocol, ProcessConnectionFactory, ProtocolError, SerialConnectionFactory, Value,
        Version,
    };
    pub use crate::scripting::{parse_script, EngineState, ScriptEngine, ScriptError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
