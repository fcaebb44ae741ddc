//! Sonicamp Protocol Communication
//!
//! Implements the sonicamp text protocol: packet framing, the package fetcher
//! that demultiplexes answers and device logs, the request/response
//! communicator, and the versioned command registry with answer validation.
//!
//! Supports both the framed protocol (`<dest#src#id#len#payload>`) and the
//! legacy newline protocol of firmware before 1.0.

mod answer;
pub(crate) mod catalog;
pub mod commands;
mod communicator;
mod error;
mod executor;
mod fetcher;
pub mod packet;
mod registry;
pub mod serial;

pub use answer::{
    Answer, AnswerDef, AnswerValidator, CommunicationMode, Converter, Field, FieldDef, FieldSlot,
    IndexedField, RelayMode, Validation, Value, ValueDict,
};
pub use commands::{request_alias, Command, CommandCode, CommandDef, SetterKind, SetterValue};
pub use communicator::Communicator;
pub use error::ProtocolError;
pub use executor::{CommandCallLog, CommandCallRecord, CommandExecutor};
pub use fetcher::{tracing_log_sink, DeviceLogSink, LogLevel, PackageFetcher, PendingAnswer};
pub use packet::{Frame, FrameProtocol, Packet, SonicCodec};
pub use registry::{
    BuildType, CommandLookUp, CommandLookUpTable, DeviceFilter, DeviceType, ProtocolRegistry,
    RegistryEntry, Version, VersionRange, FRAMED_VERSION, LEGACY_VERSIONS,
};
pub use serial::{
    BoxReader, BoxWriter, ConnectionFactory, FnConnectionFactory, ProcessConnectionFactory,
    SerialConnectionFactory,
};

/// Default baud rate for sonicamp communication
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for a single request attempt in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Number of attempts before a request is considered lost
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Maximum payload size of a single packet
pub const MAX_PAYLOAD_SIZE: usize = 2048;
