//! Request/response communicator
//!
//! Owns the writer half of the device stream and the package fetcher that
//! owns the reader half. Requests are serialized through one async lock so
//! every caller sees the answer to its own request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::codec::Encoder;
use tracing::{debug, info, warn};

use super::fetcher::{tracing_log_sink, DeviceLogSink, PackageFetcher};
use super::packet::{FrameProtocol, Packet, SonicCodec};
use super::serial::{BoxWriter, ConnectionFactory};
use super::ProtocolError;
use crate::config::CommunicatorConfig;
use crate::events::{Event, EventBus};

struct Link {
    writer: Option<BoxWriter>,
    next_id: u16,
}

impl Link {
    fn next_id(&mut self) -> u16 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}

/// Serialized request/response access to one sonicamp
pub struct Communicator {
    config: CommunicatorConfig,
    link: tokio::sync::Mutex<Link>,
    fetcher: Mutex<Option<Arc<PackageFetcher>>>,
    factory: Mutex<Option<(Arc<dyn ConnectionFactory>, u32)>>,
    connection_opened: AtomicBool,
    events: EventBus,
    log_sink: DeviceLogSink,
}

impl Communicator {
    /// Create a stopped communicator
    pub fn new(config: CommunicatorConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            config,
            link: tokio::sync::Mutex::new(Link {
                writer: None,
                next_id: 0,
            }),
            fetcher: Mutex::new(None),
            factory: Mutex::new(None),
            connection_opened: AtomicBool::new(false),
            events,
            log_sink: tracing_log_sink(),
        }
    }

    /// Publish on an existing bus instead of a private one
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Deliver device `LOG=` lines to `sink`
    pub fn with_log_sink(mut self, sink: DeviceLogSink) -> Self {
        self.log_sink = sink;
        self
    }

    /// Settings the communicator was created with
    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    /// Framing in use
    pub fn protocol(&self) -> FrameProtocol {
        self.config.protocol
    }

    /// Bus receiving connection events
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether the link is open
    pub fn connection_opened(&self) -> bool {
        self.connection_opened.load(Ordering::SeqCst)
    }

    /// Baud rate of the current (or last) connection
    pub fn baud_rate(&self) -> Option<u32> {
        self.factory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(_, baud_rate)| *baud_rate)
    }

    fn fetcher(&self) -> Result<Arc<PackageFetcher>, ProtocolError> {
        self.fetcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ProtocolError::NotConnected)
    }

    /// Open the byte stream, nudge the device with a newline and start the fetcher
    pub async fn open_communication(
        &self,
        factory: Arc<dyn ConnectionFactory>,
        baud_rate: u32,
    ) -> Result<(), ProtocolError> {
        let mut link = self.link.lock().await;
        if self.connection_opened() {
            return Err(ProtocolError::AlreadyConnected);
        }

        info!(connection = %factory.describe(), baud_rate, "opening communication");
        let (reader, mut writer) = factory.open(baud_rate).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let fetcher = PackageFetcher::start(
            reader,
            self.config.protocol,
            self.config.message_queue_size,
            self.log_sink.clone(),
        );
        *self.fetcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(fetcher);
        *self.factory.lock().unwrap_or_else(|e| e.into_inner()) = Some((factory, baud_rate));
        link.writer = Some(writer);
        self.connection_opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Send `request` and wait for the device's answer.
    ///
    /// A connection error closes the communicator before it is returned.
    pub async fn send_and_wait_for_response(&self, request: &str) -> Result<String, ProtocolError> {
        let mut link = self.link.lock().await;
        let result = match self.fetcher() {
            Ok(fetcher) => match self.config.protocol {
                FrameProtocol::Framed => self.exchange_framed(&mut link, &fetcher, request).await,
                FrameProtocol::Legacy => self.exchange_legacy(&mut link, &fetcher, request).await,
            },
            Err(e) => Err(e),
        };
        drop(link);

        if let Err(e) = &result {
            if e.is_connection_error() && self.connection_opened() {
                warn!(request, error = %e, "closing communication after connection error");
                self.close_communication(false).await;
            }
        }
        result
    }

    async fn exchange_framed(
        &self,
        link: &mut Link,
        fetcher: &PackageFetcher,
        request: &str,
    ) -> Result<String, ProtocolError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            let id = link.next_id();
            let pending = fetcher.expect(id)?;
            self.write_packet(link, Packet::new(id, request)).await?;
            debug!(id, request, attempt, "request sent");

            match tokio::time::timeout(self.config.request_timeout(), pending.wait()).await {
                Ok(answer) => return answer,
                Err(_) => warn!(id, request, attempt, "request timed out"),
            }
        }
        Err(ProtocolError::Timeout {
            request: request.to_string(),
            attempts,
        })
    }

    async fn exchange_legacy(
        &self,
        link: &mut Link,
        fetcher: &PackageFetcher,
        request: &str,
    ) -> Result<String, ProtocolError> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            fetcher.clear_messages();
            let id = link.next_id();
            self.write_packet(link, Packet::new(id, request)).await?;
            debug!(request, attempt, "legacy request sent");

            let deadline = Instant::now() + self.config.request_timeout();
            let Some(first) = fetcher.read_message(self.config.request_timeout()).await else {
                if !fetcher.is_running() {
                    return Err(ProtocolError::ConnectionLost(
                        "package fetcher stopped".to_string(),
                    ));
                }
                warn!(request, attempt, "request timed out");
                continue;
            };

            let mut lines = vec![first];
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                match fetcher
                    .read_message(self.config.line_timeout().min(left))
                    .await
                {
                    Some(line) => lines.push(line),
                    None => break,
                }
            }
            return Ok(lines.join("\n"));
        }
        Err(ProtocolError::Timeout {
            request: request.to_string(),
            attempts,
        })
    }

    async fn write_packet(&self, link: &mut Link, packet: Packet) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::new();
        SonicCodec::new(self.config.protocol).encode(packet, &mut buf)?;
        let writer = link.writer.as_mut().ok_or(ProtocolError::NotConnected)?;

        // The firmware loses bytes when its input buffer is flooded
        let chunk_size = self.config.write_chunk_size.max(1);
        for (i, chunk) in buf.chunks(chunk_size).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.write_chunk_delay()).await;
            }
            writer.write_all(chunk).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Next raw message received from the device, waiting at most `timeout`
    pub async fn read_message(&self, timeout: Duration) -> Result<Option<String>, ProtocolError> {
        Ok(self.fetcher()?.read_message(timeout).await)
    }

    /// Collect raw messages for up to `budget`.
    ///
    /// Stops early once something was received and the device then stays
    /// silent for `line_timeout`.
    pub async fn read_long_message(
        &self,
        budget: Duration,
        line_timeout: Duration,
    ) -> Result<Vec<String>, ProtocolError> {
        let fetcher = self.fetcher()?;
        let deadline = Instant::now() + budget;
        let mut lines = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match fetcher.read_message(line_timeout.min(left)).await {
                Some(line) => lines.push(line),
                None if !fetcher.is_running() => break,
                None if !lines.is_empty() => break,
                None => {}
            }
        }
        debug!(lines = lines.len(), "long message read");
        Ok(lines)
    }

    /// Reopen the connection at a new baud rate without emitting `Disconnected`
    pub async fn change_baudrate(&self, baud_rate: u32) -> Result<(), ProtocolError> {
        let factory = self
            .factory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|(factory, _)| factory.clone())
            .ok_or(ProtocolError::NotConnected)?;
        info!(baud_rate, "changing baud rate");
        self.close_communication(true).await;
        self.open_communication(factory, baud_rate).await
    }

    /// Stop the fetcher and release the streams.
    ///
    /// Emits [`Event::Disconnected`] at most once per open connection, and
    /// never when `restart` is set.
    pub async fn close_communication(&self, restart: bool) {
        let was_open = self.connection_opened.swap(false, Ordering::SeqCst);

        let fetcher = self
            .fetcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(fetcher) = fetcher {
            fetcher.stop().await;
        }

        let writer = self.link.lock().await.writer.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "writer shutdown failed");
            }
        }

        if was_open && !restart {
            info!("communication closed");
            self.events.emit(Event::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_wrap_at_u16() {
        let mut link = Link {
            writer: None,
            next_id: u16::MAX - 1,
        };
        assert_eq!(link.next_id(), u16::MAX);
        assert_eq!(link.next_id(), 0);
        assert_eq!(link.next_id(), 1);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let communicator = Communicator::new(CommunicatorConfig::default());
        assert!(matches!(
            communicator.send_and_wait_for_response("?").await,
            Err(ProtocolError::NotConnected)
        ));
        assert!(!communicator.connection_opened());
    }
}
