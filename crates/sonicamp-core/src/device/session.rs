//! Device session
//!
//! A [`SonicDevice`] is a cloneable handle to one connected sonicamp: its
//! communicator, the command table deduced at handshake, the live status and
//! the identity info. Every typed command goes through the table; commands
//! the table does not list are refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::status::{Info, Status, StatusHandle};
use super::DeviceError;
use crate::config::DeviceConfig;
use crate::events::EventBus;
use crate::protocol::{
    Answer, Command, CommandCode, CommandExecutor, CommandLookUpTable, Communicator, Field,
    RelayMode, Value, ValueDict,
};

/// What the auto-updater polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// `?sens`, while the signal is on in MHz mode
    Sens,
    /// `-` compact status
    Status,
    /// `?` overview
    Overview,
}

impl UpdateStrategy {
    fn code(&self) -> CommandCode {
        match self {
            UpdateStrategy::Sens => CommandCode::GetSens,
            UpdateStrategy::Status => CommandCode::GetStatus,
            UpdateStrategy::Overview => CommandCode::GetOverview,
        }
    }
}

struct Updater {
    strategy: UpdateStrategy,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct DeviceInner {
    communicator: Arc<Communicator>,
    executor: CommandExecutor,
    table: CommandLookUpTable,
    status: StatusHandle,
    info: Info,
    config: DeviceConfig,
    events: EventBus,
    cancel: CancellationToken,
    auto_update: AtomicBool,
    updater: Mutex<Option<Updater>>,
}

/// Handle to a connected sonicamp
#[derive(Clone)]
pub struct SonicDevice {
    inner: Arc<DeviceInner>,
}

impl SonicDevice {
    /// Assemble a session from the parts the builder deduced
    pub fn from_parts(
        executor: CommandExecutor,
        table: CommandLookUpTable,
        status: Status,
        info: Info,
        config: DeviceConfig,
    ) -> Self {
        let communicator = executor.communicator().clone();
        let events = communicator.events().clone();
        Self {
            inner: Arc::new(DeviceInner {
                status: StatusHandle::new(status, events.clone()),
                communicator,
                executor,
                table,
                info,
                config,
                events,
                cancel: CancellationToken::new(),
                auto_update: AtomicBool::new(false),
                updater: Mutex::new(None),
            }),
        }
    }

    /// Communicator the session talks through
    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.inner.communicator
    }

    /// Commands this device supports
    pub fn command_table(&self) -> &CommandLookUpTable {
        &self.inner.table
    }

    /// Identity found during the handshake
    pub fn info(&self) -> &Info {
        &self.inner.info
    }

    /// Settings the session was built with
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Bus receiving status and procedure events
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Live status with its change signals
    pub fn status(&self) -> &StatusHandle {
        &self.inner.status
    }

    /// Cancelled when the device disconnects; procedures and scripts hang
    /// their own tokens off it
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Whether the link is still open
    pub fn is_connected(&self) -> bool {
        self.inner.communicator.connection_opened()
    }

    /// Whether the command table has `code`
    pub fn has_command(&self, code: CommandCode) -> bool {
        self.inner.table.has(code)
    }

    /// Whether a raw request such as `!f=1000` addresses a known command
    pub fn has_command_alias(&self, request: &str) -> bool {
        self.inner.table.find_by_request(request).is_some()
    }

    /// Execute a typed command and merge its answer into the status
    pub async fn execute_command(&self, command: impl Into<Command>) -> Result<Answer, DeviceError> {
        self.execute_command_with(command, ValueDict::new()).await
    }

    /// Execute a typed command; on a valid answer `overrides` are merged
    /// into the status together with the answer's fields
    pub async fn execute_command_with(
        &self,
        command: impl Into<Command>,
        overrides: ValueDict,
    ) -> Result<Answer, DeviceError> {
        let command = command.into();
        let answer = self.send_command(&command).await?;
        self.apply_answer(&answer, overrides);
        self.reselect_updater().await;
        Ok(answer)
    }

    /// Execute a raw request.
    ///
    /// If the request addresses a command of the table, its answer is
    /// validated and merged into the status; otherwise it is sent as is.
    pub async fn execute_raw(&self, request: &str) -> Result<Answer, DeviceError> {
        let answer_def = self
            .inner
            .table
            .find_by_request(request)
            .map(|lookup| &lookup.answer_def);
        let answer = self.guard(self.inner.executor.send_request(request, answer_def).await)?;
        if answer_def.is_some() {
            self.apply_answer(&answer, ValueDict::new());
            self.reselect_updater().await;
        }
        Ok(answer)
    }

    /// Send a raw message without validation or status update
    pub async fn send_message(&self, message: &str) -> Result<Answer, DeviceError> {
        self.guard(self.inner.executor.send_message(message).await)
    }

    async fn send_command(&self, command: &Command) -> Result<Answer, DeviceError> {
        let lookup = self
            .inner
            .table
            .get(command.code)
            .ok_or(DeviceError::UnsupportedCommand(command.code))?;
        self.guard(self.inner.executor.send_command(command, lookup).await)
    }

    fn apply_answer(&self, answer: &Answer, overrides: ValueDict) {
        let mut values = answer.value_dict.clone();
        if answer.valid {
            values.extend(overrides);
        }
        self.inner.status.update(&values, answer.received_at);
    }

    /// Tear the session down when the link died underneath a request
    fn guard(&self, result: Result<Answer, DeviceError>) -> Result<Answer, DeviceError> {
        if let Err(e) = &result {
            if e.is_connection_error() && !self.inner.cancel.is_cancelled() {
                warn!(error = %e, "device connection lost");
                self.inner.cancel.cancel();
            }
        }
        result
    }

    /// Execute a command and fail if the device did not acknowledge it
    pub async fn execute_checked(&self, command: impl Into<Command>) -> Result<Answer, DeviceError> {
        let command = command.into();
        let answer = self.execute_command(command.clone()).await?;
        if !answer.valid {
            return Err(DeviceError::InvalidAnswer {
                request: format!("{:?}", command.code),
                answer: answer.message,
            });
        }
        Ok(answer)
    }

    /// `!f=`
    pub async fn set_frequency(&self, frequency: i64) -> Result<Answer, DeviceError> {
        self.execute_command(Command::new(CommandCode::SetFrequency).with_value(frequency))
            .await
    }

    /// `!g=`
    pub async fn set_gain(&self, gain: i64) -> Result<Answer, DeviceError> {
        self.execute_command(Command::new(CommandCode::SetGain).with_value(gain))
            .await
    }

    /// `!ON`
    pub async fn set_signal_on(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetOn,
            ValueDict::from([(Field::Signal, Value::Bool(true))]),
        )
        .await
    }

    /// `!OFF`
    pub async fn set_signal_off(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetOff,
            ValueDict::from([(Field::Signal, Value::Bool(false))]),
        )
        .await
    }

    /// `!KHZ`
    pub async fn set_relay_mode_khz(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetKhz,
            ValueDict::from([(Field::RelayMode, Value::RelayMode(RelayMode::Khz))]),
        )
        .await
    }

    /// `!MHZ`
    pub async fn set_relay_mode_mhz(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetMhz,
            ValueDict::from([(Field::RelayMode, Value::RelayMode(RelayMode::Mhz))]),
        )
        .await
    }

    /// `!SERIAL`
    pub async fn set_serial_mode(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetSerialMode,
            ValueDict::from([(
                Field::CommunicationMode,
                Value::CommunicationMode(crate::protocol::CommunicationMode::Serial),
            )]),
        )
        .await
    }

    /// `!ANALOG`
    pub async fn set_analog_mode(&self) -> Result<Answer, DeviceError> {
        self.execute_command_with(
            CommandCode::SetAnalogMode,
            ValueDict::from([(
                Field::CommunicationMode,
                Value::CommunicationMode(crate::protocol::CommunicationMode::Analog),
            )]),
        )
        .await
    }

    /// `!AUTO` (scan and tune on the device)
    pub async fn set_auto(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::SetAuto).await
    }

    /// `!atf<index>=`
    pub async fn set_atf(&self, index: u8, frequency: i64) -> Result<Answer, DeviceError> {
        self.execute_command(
            Command::new(CommandCode::SetAtf)
                .with_index(index)
                .with_value(frequency),
        )
        .await
    }

    /// `!atk<index>=`
    pub async fn set_atk(&self, index: u8, coefficient: f64) -> Result<Answer, DeviceError> {
        self.execute_command(
            Command::new(CommandCode::SetAtk)
                .with_index(index)
                .with_value(coefficient),
        )
        .await
    }

    /// `!att<index>=`
    pub async fn set_att(&self, index: u8, temperature: f64) -> Result<Answer, DeviceError> {
        self.execute_command(
            Command::new(CommandCode::SetAtt)
                .with_index(index)
                .with_value(temperature),
        )
        .await
    }

    /// `!aton<index>=`
    pub async fn set_aton(&self, index: u8, duration_ms: i64) -> Result<Answer, DeviceError> {
        self.execute_command(
            Command::new(CommandCode::SetAton)
                .with_index(index)
                .with_value(duration_ms),
        )
        .await
    }

    /// `-` compact status
    pub async fn get_status(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetStatus).await
    }

    /// `?sens`
    pub async fn get_sens(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetSens).await
    }

    /// `?` overview
    pub async fn get_overview(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetOverview).await
    }

    /// `?info`
    pub async fn get_info(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetInfo).await
    }

    /// `?type`
    pub async fn get_type(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetType).await
    }

    /// `?update`
    pub async fn get_update(&self) -> Result<Answer, DeviceError> {
        self.execute_command(CommandCode::GetUpdate).await
    }

    /// Refresh the status with the richest command the table offers,
    /// without touching the auto-updater
    pub async fn poll_status(&self) -> Result<Answer, DeviceError> {
        let code = [
            CommandCode::GetStatus,
            CommandCode::GetUpdate,
            CommandCode::GetOverview,
        ]
        .into_iter()
        .find(|code| self.has_command(*code))
        .ok_or(DeviceError::UnsupportedCommand(CommandCode::GetStatus))?;
        self.poll(code).await
    }

    async fn poll(&self, code: CommandCode) -> Result<Answer, DeviceError> {
        let answer = self.send_command(&Command::new(code)).await?;
        self.apply_answer(&answer, ValueDict::new());
        Ok(answer)
    }

    /// Strategy the auto-updater should use for the current status
    pub fn update_strategy(&self) -> Option<UpdateStrategy> {
        let (signal, relay_mode) = self
            .inner
            .status
            .with(|status| (status.signal(), status.relay_mode()));
        if signal == Some(true)
            && relay_mode == Some(RelayMode::Mhz)
            && self.has_command(CommandCode::GetSens)
        {
            Some(UpdateStrategy::Sens)
        } else if self.has_command(CommandCode::GetStatus) {
            Some(UpdateStrategy::Status)
        } else if self.has_command(CommandCode::GetOverview) {
            Some(UpdateStrategy::Overview)
        } else {
            None
        }
    }

    /// Start polling the status in the background
    pub async fn start_auto_update(&self) {
        self.inner.auto_update.store(true, Ordering::SeqCst);
        self.reselect_updater().await;
    }

    /// Stop the background poller and wait for it
    pub async fn stop_auto_update(&self) {
        self.inner.auto_update.store(false, Ordering::SeqCst);
        let updater = self.inner.updater.lock().await.take();
        if let Some(updater) = updater {
            updater.cancel.cancel();
            let _ = updater.task.await;
        }
    }

    /// Strategy of the running auto-updater
    pub async fn active_update_strategy(&self) -> Option<UpdateStrategy> {
        self.inner
            .updater
            .lock()
            .await
            .as_ref()
            .filter(|updater| !updater.task.is_finished())
            .map(|updater| updater.strategy)
    }

    async fn reselect_updater(&self) {
        if !self.inner.auto_update.load(Ordering::SeqCst) || self.inner.cancel.is_cancelled() {
            return;
        }
        let desired = self.update_strategy();
        let mut updater = self.inner.updater.lock().await;
        let current = updater
            .as_ref()
            .filter(|u| !u.task.is_finished())
            .map(|u| u.strategy);
        if current == desired {
            return;
        }

        if let Some(old) = updater.take() {
            old.cancel.cancel();
            let _ = old.task.await;
        }
        if let Some(strategy) = desired {
            debug!(?strategy, "starting auto-updater");
            let cancel = self.inner.cancel.child_token();
            let task = tokio::spawn(run_updater(
                Arc::downgrade(&self.inner),
                strategy,
                cancel.clone(),
            ));
            *updater = Some(Updater {
                strategy,
                cancel,
                task,
            });
        }
    }

    /// Cancel running procedures and scripts, stop polling, close the link
    pub async fn disconnect(&self) {
        info!("disconnecting device");
        self.inner.cancel.cancel();
        self.stop_auto_update().await;
        self.inner.communicator.close_communication(false).await;
    }
}

/// Poll loop of the auto-updater.
///
/// Boxed because the loop may hand over to a new updater, and the two
/// futures would otherwise name each other's type.
fn run_updater(
    device: Weak<DeviceInner>,
    strategy: UpdateStrategy,
    cancel: CancellationToken,
) -> BoxFuture<'static, ()> {
    async move {
        loop {
            let Some(inner) = device.upgrade() else {
                return;
            };
            let device = SonicDevice { inner };
            let interval = device.config().update_interval();

            match device.poll(strategy.code()).await {
                Ok(_) => {}
                Err(e) if e.is_connection_error() => {
                    warn!(error = %e, "auto-updater stopped");
                    return;
                }
                Err(e) => warn!(error = %e, ?strategy, "status poll failed"),
            }

            if device.update_strategy() != Some(strategy) {
                // Reselection cancels this task, so hand it to a fresh one
                tokio::spawn(async move { device.reselect_updater().await });
                return;
            }
            drop(device);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
    .boxed()
}
