//! Shared fixtures for the integration tests
//!
//! A [`MockDevice`] answers requests over an in-memory duplex stream and
//! records everything the host wrote, so tests can assert exact wire traffic.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::FramedRead;

use sonicamp_core::config::{CommunicatorConfig, DeviceConfig};
use sonicamp_core::demo::DemoSonicamp;
use sonicamp_core::device::{DeviceBuilder, SonicDevice};
use sonicamp_core::protocol::serial::{BoxReader, BoxWriter, FnConnectionFactory};
use sonicamp_core::protocol::{
    Communicator, ConnectionFactory, Frame, FrameProtocol, Packet, SonicCodec,
};

/// Maps a request payload to its answer; `None` leaves the request unanswered
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

/// One request as the device received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Packet id, 0 for legacy lines
    pub id: u16,
    pub payload: String,
}

/// Scripted device on the far end of a duplex stream
#[derive(Clone)]
pub struct MockDevice {
    protocol: FrameProtocol,
    banner: Vec<String>,
    responder: Arc<Mutex<Responder>>,
    received: Arc<Mutex<Vec<Received>>>,
    opened: Arc<Mutex<Vec<u32>>>,
}

impl MockDevice {
    pub fn new(
        protocol: FrameProtocol,
        responder: impl FnMut(&str) -> Option<String> + Send + 'static,
    ) -> Self {
        Self {
            protocol,
            banner: Vec::new(),
            responder: Arc::new(Mutex::new(Box::new(responder))),
            received: Arc::new(Mutex::new(Vec::new())),
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Framed device answering like the simulator
    pub fn demo(seed: u64) -> Self {
        let mut amp = DemoSonicamp::with_seed(seed);
        Self::new(FrameProtocol::Framed, move |request| Some(amp.handle(request)))
    }

    /// Legacy device printing `banner` as soon as the link opens
    pub fn with_banner(mut self, banner: &[&str]) -> Self {
        self.banner = banner.iter().map(|line| line.to_string()).collect();
        self
    }

    /// Payloads received so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.payload.clone())
            .collect()
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Forget what was received so far
    pub fn clear(&self) {
        self.received.lock().unwrap().clear();
    }

    /// Baud rates of every open, in order
    pub fn opened(&self) -> Vec<u32> {
        self.opened.lock().unwrap().clone()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        let device = self.clone();
        Arc::new(FnConnectionFactory::new("mock", move |baud_rate| {
            device.opened.lock().unwrap().push(baud_rate);
            let (host, far) = tokio::io::duplex(8 * 1024);
            tokio::spawn(device.clone().serve(far));
            let (reader, writer) = tokio::io::split(host);
            Ok((Box::new(reader) as BoxReader, Box::new(writer) as BoxWriter))
        }))
    }

    async fn serve(self, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        for line in &self.banner {
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }

        let mut frames = FramedRead::new(reader, SonicCodec::new(self.protocol));
        while let Some(Ok(frame)) = frames.next().await {
            let (id, payload) = match frame {
                Frame::Packet(packet) => (packet.id, packet.payload),
                Frame::Line(line) if line.trim().is_empty() => continue,
                Frame::Line(line) => (0, line),
            };
            self.received.lock().unwrap().push(Received {
                id,
                payload: payload.clone(),
            });

            let answer = (self.responder.lock().unwrap())(&payload);
            let Some(answer) = answer else { continue };
            let wire = match self.protocol {
                FrameProtocol::Framed => match Packet::new(id, answer).to_wire() {
                    Ok(wire) => wire,
                    Err(_) => continue,
                },
                FrameProtocol::Legacy => format!("{answer}\n"),
            };
            if writer.write_all(wire.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Communicator settings that keep tests fast
pub fn fast_config(protocol: FrameProtocol) -> CommunicatorConfig {
    CommunicatorConfig {
        protocol,
        request_timeout_ms: 300,
        max_attempts: 2,
        write_chunk_delay_ms: 0,
        handshake_budget_ms: 500,
        handshake_line_timeout_ms: 30,
        ..CommunicatorConfig::default()
    }
}

pub fn fast_device_config() -> DeviceConfig {
    DeviceConfig {
        update_interval_ms: 20,
        procedure_poll_interval_ms: 20,
        ..DeviceConfig::default()
    }
}

/// Route library logs to the test harness; `RUST_LOG=debug` shows the wire traffic
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn open(mock: &MockDevice, config: CommunicatorConfig) -> Arc<Communicator> {
    init_tracing();
    let baud_rate = config.baud_rate;
    let communicator = Arc::new(Communicator::new(config));
    communicator
        .open_communication(mock.factory(), baud_rate)
        .await
        .expect("mock opens");
    communicator
}

/// Open `mock` and run the handshake
pub async fn connect(mock: &MockDevice) -> SonicDevice {
    let communicator = open(mock, fast_config(mock.protocol)).await;
    DeviceBuilder::new()
        .with_config(fast_device_config())
        .build(communicator)
        .await
        .expect("handshake succeeds")
}

pub const LEGACY_BANNER: [&str; 4] = ["ver 0.4.0", "soniccatch", "signal off", "khz mode"];

/// A sonicatch on firmware 0.4.0 speaking the line protocol
pub fn legacy_catch() -> MockDevice {
    let mut frequency = 1_000_000_i64;
    let mut gain = 50_i64;
    let mut signal = false;
    MockDevice::new(FrameProtocol::Legacy, move |request| {
        let state = |signal: bool| if signal { "on" } else { "off" };
        let answer = match request {
            "?" => format!(
                "ver 0.4.0\nsoniccatch\nsignal {}\nkhz mode\nfrequency: {frequency}\ngain: {gain}",
                state(signal)
            ),
            "?info" => "ver 0.4.0\nsoniccatch".to_string(),
            "?type" => "soniccatch".to_string(),
            "-" => format!(
                "{}-{gain}-23.5",
                if signal { frequency } else { 0 }
            ),
            "?sens" => format!("{frequency} 500 300 20"),
            "!ON" => {
                signal = true;
                "signal on".to_string()
            }
            "!OFF" => {
                signal = false;
                "signal off".to_string()
            }
            "!KHZ" => "khz mode".to_string(),
            "!MHZ" => "mhz mode".to_string(),
            "!SERIAL" => "serial mode".to_string(),
            "!ANALOG" => "analog mode".to_string(),
            "!AUTO" => "auto mode".to_string(),
            other => {
                if let Some(value) = other.strip_prefix("!f=") {
                    frequency = value.parse().ok()?;
                    format!("frequency: {frequency}")
                } else if let Some(value) = other.strip_prefix("!g=") {
                    gain = value.parse().ok()?;
                    format!("gain: {gain}")
                } else {
                    format!("unknown command: {other}")
                }
            }
        };
        Some(answer)
    })
    .with_banner(&LEGACY_BANNER)
}

/// Requests recorded after the handshake, without status polls
pub fn commands(requests: &[String]) -> Vec<String> {
    requests
        .iter()
        .filter(|r| !matches!(r.as_str(), "?" | "-" | "?sens" | "?update"))
        .cloned()
        .collect()
}
