//! Package fetcher
//!
//! A single background task owns the reader half of the device stream. It
//! decodes frames, routes `LOG=<LEVEL>:` lines to the device log sink and
//! files every remaining answer under the id of the packet that carried it.
//! Every raw frame is also kept in a small ring buffer for `read_message`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::packet::{Frame, FrameProtocol, Packet, SonicCodec};
use super::serial::BoxReader;
use super::ProtocolError;

/// Severity of a device log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// `LOG=ERROR:`
    Error,
    /// `LOG=WARN:`
    Warn,
    /// `LOG=INFO:`
    Info,
    /// `LOG=DEBUG:`
    Debug,
}

impl LogLevel {
    fn parse(level: &str) -> Option<Self> {
        match level.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Some(LogLevel::Error),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// Callback receiving device log lines
pub type DeviceLogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Default sink: re-emit device logs through `tracing`
pub fn tracing_log_sink() -> DeviceLogSink {
    Arc::new(|level, line| match level {
        LogLevel::Error => tracing::error!(target: "sonicamp::device", "{line}"),
        LogLevel::Warn => tracing::warn!(target: "sonicamp::device", "{line}"),
        LogLevel::Info => tracing::info!(target: "sonicamp::device", "{line}"),
        LogLevel::Debug => tracing::debug!(target: "sonicamp::device", "{line}"),
    })
}

/// Split `LOG=INFO: message` into its level and message
pub(crate) fn parse_log_line(line: &str) -> Option<(LogLevel, &str)> {
    let rest = line.strip_prefix("LOG=")?;
    let (level, message) = rest.split_once(':')?;
    Some((LogLevel::parse(level)?, message.trim()))
}

enum Slot {
    Waiting(oneshot::Sender<String>),
    Ready(String),
}

/// Answers by packet id. Unclaimed answers are kept oldest first and capped.
struct Answers {
    slots: HashMap<u16, Slot>,
    unclaimed: VecDeque<u16>,
    capacity: usize,
}

impl Answers {
    fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            unclaimed: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn wait_for(&mut self, id: u16, tx: oneshot::Sender<String>) {
        self.unclaimed.retain(|unclaimed| *unclaimed != id);
        self.slots.insert(id, Slot::Waiting(tx));
    }

    fn take_ready(&mut self, id: u16) -> Option<String> {
        match self.slots.remove(&id) {
            Some(Slot::Ready(answer)) => {
                self.unclaimed.retain(|unclaimed| *unclaimed != id);
                Some(answer)
            }
            Some(waiting) => {
                self.slots.insert(id, waiting);
                None
            }
            None => None,
        }
    }

    fn file_unclaimed(&mut self, id: u16, answer: String) {
        self.unclaimed.retain(|unclaimed| *unclaimed != id);
        self.slots.insert(id, Slot::Ready(answer));
        self.unclaimed.push_back(id);
        while self.unclaimed.len() > self.capacity {
            if let Some(oldest) = self.unclaimed.pop_front() {
                debug!(id = oldest, "evicting unclaimed answer");
                self.slots.remove(&oldest);
            }
        }
    }
}

struct Shared {
    answers: Mutex<Answers>,
    messages: Mutex<VecDeque<String>>,
    message_capacity: usize,
    message_ready: Notify,
    alive: AtomicBool,
    log_sink: DeviceLogSink,
}

impl Shared {
    fn answers(&self) -> MutexGuard<'_, Answers> {
        self.answers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Packet(packet) => self.dispatch_packet(packet),
            Frame::Line(line) => {
                let line = line.trim();
                if line.is_empty() {
                    return;
                }
                if let Some((level, message)) = parse_log_line(line) {
                    (self.log_sink)(level, message);
                    return;
                }
                self.push_message(line.to_string());
            }
        }
    }

    fn dispatch_packet(&self, packet: Packet) {
        self.push_message(format!(
            "<{}#{}#{}#{}#{}>",
            packet.destination,
            packet.source,
            packet.id,
            packet.payload.len(),
            packet.payload
        ));

        let mut body = Vec::new();
        for line in packet.payload.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_log_line(line) {
                Some((level, message)) => (self.log_sink)(level, message),
                None => body.push(line),
            }
        }

        let mut answers = self.answers();
        match answers.slots.remove(&packet.id) {
            Some(Slot::Waiting(tx)) => {
                if tx.send(body.join("\n")).is_err() {
                    debug!(id = packet.id, "late answer dropped");
                }
            }
            _ if body.is_empty() => {
                debug!(id = packet.id, "log-only packet");
            }
            _ => answers.file_unclaimed(packet.id, body.join("\n")),
        }
    }

    fn push_message(&self, message: String) {
        {
            let mut messages = self.messages();
            while messages.len() >= self.message_capacity.max(1) {
                messages.pop_front();
            }
            messages.push_back(message);
        }
        self.message_ready.notify_one();
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with an error
        self.answers()
            .slots
            .retain(|_, slot| matches!(slot, Slot::Ready(_)));
        self.message_ready.notify_waiters();
    }
}

/// A registered interest in the answer for one packet id.
///
/// Dropping it before the answer arrives unregisters the id.
pub struct PendingAnswer {
    id: u16,
    rx: oneshot::Receiver<String>,
    shared: Arc<Shared>,
}

impl PendingAnswer {
    /// Id this answer is filed under
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Wait until the fetcher has the answer
    pub async fn wait(mut self) -> Result<String, ProtocolError> {
        (&mut self.rx)
            .await
            .map_err(|_| ProtocolError::ConnectionLost("package fetcher stopped".to_string()))
    }
}

impl Drop for PendingAnswer {
    fn drop(&mut self) {
        self.rx.close();
        let mut answers = self.shared.answers();
        if let Some(Slot::Waiting(tx)) = answers.slots.get(&self.id) {
            if tx.is_closed() {
                answers.slots.remove(&self.id);
            }
        }
    }
}

/// Background demultiplexer over the device reader
pub struct PackageFetcher {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PackageFetcher {
    /// Spawn the fetcher task over `reader`
    pub fn start(
        reader: BoxReader,
        protocol: FrameProtocol,
        message_capacity: usize,
        log_sink: DeviceLogSink,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            answers: Mutex::new(Answers::new(message_capacity)),
            messages: Mutex::new(VecDeque::with_capacity(message_capacity)),
            message_capacity,
            message_ready: Notify::new(),
            alive: AtomicBool::new(true),
            log_sink,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            FramedRead::new(reader, SonicCodec::new(protocol)),
            shared.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Whether the fetcher is still reading
    pub fn is_running(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Register for the answer to packet `id`. Call before writing the request.
    pub fn expect(&self, id: u16) -> Result<PendingAnswer, ProtocolError> {
        if !self.is_running() {
            return Err(ProtocolError::ConnectionLost(
                "package fetcher is not running".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.shared.answers().wait_for(id, tx);
        Ok(PendingAnswer {
            id,
            rx,
            shared: self.shared.clone(),
        })
    }

    /// Wait for the answer filed under `id`, taking it out of the fetcher
    pub async fn get_answer_of_package(&self, id: u16) -> Result<String, ProtocolError> {
        let ready = self.shared.answers().take_ready(id);
        match ready {
            Some(answer) => Ok(answer),
            None => self.expect(id)?.wait().await,
        }
    }

    /// Pop the oldest raw message, waiting at most `timeout` for one to arrive
    pub async fn read_message(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.message_ready.notified();
            if let Some(message) = self.shared.messages().pop_front() {
                return Some(message);
            }
            if !self.is_running() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.messages().pop_front();
            }
        }
    }

    /// Drop all queued raw messages
    pub fn clear_messages(&self) {
        self.shared.messages().clear();
    }

    /// Stop the task and wait for it to finish
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            // A cancelled fetcher is not an error
            let _ = task.await;
        }
        self.shared.shutdown();
    }
}

async fn run(
    mut frames: FramedRead<BoxReader, SonicCodec>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("package fetcher cancelled");
                break;
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => shared.dispatch(frame),
                Some(Err(e)) => {
                    error!(error = %e, "package fetcher stopped");
                    break;
                }
                None => {
                    info!("device stream closed");
                    break;
                }
            }
        }
    }
    shared.shutdown();
}
