//! Connection factories
//!
//! The communicator never opens devices itself. It asks a
//! [`ConnectionFactory`] for an opened reader/writer pair, either from a
//! serial port, from a child process speaking the protocol on stdio, or from
//! anything else that can hand out async byte streams.

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use super::ProtocolError;

/// Reader half handed to the package fetcher
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writer half owned by the communicator
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Source of opened byte-stream pairs
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open the connection at the given baud rate
    async fn open(&self, baud_rate: u32) -> Result<(BoxReader, BoxWriter), ProtocolError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Open a serial port for sonicamp communication (8N1, no flow control)
pub fn open_port(url: &str, baud_rate: u32) -> Result<SerialStream, ProtocolError> {
    tokio_serial::new(url, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| ProtocolError::SerialError(format!("{url}: {e}")))
}

/// Serial port given by URL (e.g. `/dev/ttyUSB0` or `COM3`)
#[derive(Debug, Clone)]
pub struct SerialConnectionFactory {
    url: String,
}

impl SerialConnectionFactory {
    /// Factory for the port at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Port name as given
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ConnectionFactory for SerialConnectionFactory {
    async fn open(&self, baud_rate: u32) -> Result<(BoxReader, BoxWriter), ProtocolError> {
        info!(url = %self.url, baud_rate, "opening serial port");
        let stream = open_port(&self.url, baud_rate)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }

    fn describe(&self) -> String {
        format!("serial {}", self.url)
    }
}

/// Child process speaking the protocol on stdin/stdout.
///
/// The baud rate is passed to the process as `--baudrate N` when
/// `pass_baud_rate` is set; reopening kills the previous child.
pub struct ProcessConnectionFactory {
    program: String,
    args: Vec<String>,
    pass_baud_rate: bool,
    child: Mutex<Option<Child>>,
}

impl ProcessConnectionFactory {
    /// Spawn `program` with `args` on every open
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            pass_baud_rate: false,
            child: Mutex::new(None),
        }
    }

    /// Forward the requested baud rate to the child
    pub fn with_baud_rate_argument(mut self) -> Self {
        self.pass_baud_rate = true;
        self
    }
}

#[async_trait]
impl ConnectionFactory for ProcessConnectionFactory {
    async fn open(&self, baud_rate: u32) -> Result<(BoxReader, BoxWriter), ProtocolError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if self.pass_baud_rate {
            command.arg("--baudrate").arg(baud_rate.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {e}", self.program)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProtocolError::ConnectionFailed("child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProtocolError::ConnectionFailed("child has no stdout".to_string()))?;

        let previous = self
            .child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(child);
        if let Some(mut previous) = previous {
            debug!(program = %self.program, "killing previous child process");
            let _ = previous.start_kill();
        }

        Ok((Box::new(stdout), Box::new(stdin)))
    }

    fn describe(&self) -> String {
        format!("process {}", self.program)
    }
}

/// Factory backed by a closure, handy for in-memory streams
pub struct FnConnectionFactory<F> {
    name: String,
    open: F,
}

impl<F> FnConnectionFactory<F>
where
    F: Fn(u32) -> Result<(BoxReader, BoxWriter), ProtocolError> + Send + Sync,
{
    /// Factory named `name` that calls `open` with the baud rate
    pub fn new(name: impl Into<String>, open: F) -> Self {
        Self {
            name: name.into(),
            open,
        }
    }
}

#[async_trait]
impl<F> ConnectionFactory for FnConnectionFactory<F>
where
    F: Fn(u32) -> Result<(BoxReader, BoxWriter), ProtocolError> + Send + Sync,
{
    async fn open(&self, baud_rate: u32) -> Result<(BoxReader, BoxWriter), ProtocolError> {
        (self.open)(baud_rate)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
