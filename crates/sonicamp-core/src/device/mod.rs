//! Device session
//!
//! The handshake ([`DeviceBuilder`]), the typed session ([`SonicDevice`])
//! and the status it maintains.

mod builder;
mod error;
mod session;
mod status;

pub use builder::DeviceBuilder;
pub use error::DeviceError;
pub use session::{SonicDevice, UpdateStrategy};
pub use status::{Info, Status, StatusHandle, StatusUpdate};
