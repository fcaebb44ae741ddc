//! Procedures
//!
//! Long-running device operations: ramps, scans, tunes, auto mode and wipe.
//! Every procedure runs as its own task, checks its cancellation token at
//! each hold and between steps, and leaves the signal off when it ends
//! early.

mod controller;
mod hold;
mod ramp;
mod remote;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{DeviceError, SonicDevice};
use crate::protocol::{Answer, Command};

pub use controller::ProcedureController;
pub use hold::{hold, Hold};
pub use ramp::{ramp_values, RampValues, RamperLocal, RamperRemote};
pub use remote::{await_remote_finish, RemoteProcedure};

/// Procedure kinds, with the id the firmware reports while one runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureType {
    /// Frequency scan
    Scan = 1,
    /// Frequency tracking
    Tune = 2,
    /// Scan then tune
    Auto = 3,
    /// Wipe cycle of the sonicwipe
    Wipe = 4,
    /// Frequency ramp
    Ramp = 5,
}

impl ProcedureType {
    /// Every procedure, in menu order
    pub const ALL: [ProcedureType; 5] = [
        ProcedureType::Ramp,
        ProcedureType::Scan,
        ProcedureType::Tune,
        ProcedureType::Auto,
        ProcedureType::Wipe,
    ];

    /// Id in the status `procedure` field
    pub fn remote_id(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureType::Scan => write!(f, "scan"),
            ProcedureType::Tune => write!(f, "tune"),
            ProcedureType::Auto => write!(f, "auto"),
            ProcedureType::Wipe => write!(f, "wipe"),
            ProcedureType::Ramp => write!(f, "ramp"),
        }
    }
}

/// Unit of a hold duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldUnit {
    /// Milliseconds
    #[default]
    Ms,
    /// Seconds
    S,
}

impl HoldUnit {
    /// `ms` or `s`
    pub fn parse(unit: &str) -> Option<Self> {
        match unit {
            "ms" => Some(HoldUnit::Ms),
            "s" => Some(HoldUnit::S),
            _ => None,
        }
    }
}

impl fmt::Display for HoldUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldUnit::Ms => write!(f, "ms"),
            HoldUnit::S => write!(f, "s"),
        }
    }
}

/// A duration as written by the user
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HoldDuration {
    /// Amount in `unit`
    pub duration: f64,
    /// Unit of `duration`
    pub unit: HoldUnit,
}

impl HoldDuration {
    /// Duration in milliseconds
    pub fn ms(duration: f64) -> Self {
        Self {
            duration,
            unit: HoldUnit::Ms,
        }
    }

    /// Duration in seconds
    pub fn s(duration: f64) -> Self {
        Self {
            duration,
            unit: HoldUnit::S,
        }
    }

    /// Whether there is nothing to wait for
    pub fn is_zero(&self) -> bool {
        self.duration <= 0.0
    }

    /// As a [`Duration`]; negative amounts clamp to zero
    pub fn to_duration(&self) -> Duration {
        let seconds = match self.unit {
            HoldUnit::Ms => self.duration / 1000.0,
            HoldUnit::S => self.duration,
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }

    /// Whole milliseconds, as sent to the firmware
    pub fn as_millis(&self) -> u64 {
        self.to_duration().as_millis() as u64
    }
}

impl fmt::Display for HoldDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.duration, self.unit)
    }
}

/// `10ms`, `2s` or a bare number of milliseconds
impl FromStr for HoldDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (number, unit) = if let Some(number) = s.strip_suffix("ms") {
            (number, HoldUnit::Ms)
        } else if let Some(number) = s.strip_suffix('s') {
            (number, HoldUnit::S)
        } else {
            (s, HoldUnit::Ms)
        };
        let duration: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration '{s}'"))?;
        if !duration.is_finite() || duration < 0.0 {
            return Err(format!("invalid duration '{s}'"));
        }
        Ok(Self { duration, unit })
    }
}

/// Frequency ramp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampArgs {
    /// First frequency (Hz)
    pub start: i64,
    /// Last frequency (Hz), included when a whole step lands on it
    pub stop: i64,
    /// Distance between frequencies (Hz)
    pub step: i64,
    /// Time at each frequency
    pub hold_on: HoldDuration,
    /// Pause with the output off between steps; zero keeps it on
    pub hold_off: HoldDuration,
}

/// Frequency scan around the current frequency
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanArgs {
    /// Gain during the scan (%)
    pub gain: i64,
    /// Span around the current frequency (Hz)
    pub f_range: i64,
    /// Distance between scanned frequencies (Hz)
    pub f_step: i64,
    /// Time at each frequency
    pub t_step: HoldDuration,
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self {
            gain: 10,
            f_range: 100_000,
            f_step: 1000,
            t_step: HoldDuration::ms(10.0),
        }
    }
}

/// Frequency tracking
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TuneArgs {
    /// Tuning step (Hz)
    pub f_step: i64,
    /// How long tuning runs
    pub t_time: HoldDuration,
    /// Time at each step
    pub t_step: HoldDuration,
}

impl Default for TuneArgs {
    fn default() -> Self {
        Self {
            f_step: 1000,
            t_time: HoldDuration::ms(1000.0),
            t_step: HoldDuration::ms(10.0),
        }
    }
}

/// Scan followed by tune
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoArgs {
    /// Scan phase
    pub scan: ScanArgs,
    /// Tune phase
    pub tune: TuneArgs,
}

/// Arguments of any procedure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "procedure", rename_all = "lowercase")]
pub enum ProcedureArgs {
    /// Ramp arguments
    Ramp(RampArgs),
    /// Scan arguments
    Scan(ScanArgs),
    /// Tune arguments
    Tune(TuneArgs),
    /// Scan and tune arguments
    Auto(AutoArgs),
    /// Wipe takes no arguments
    Wipe,
}

impl ProcedureArgs {
    /// Procedure these arguments are for
    pub fn procedure_type(&self) -> ProcedureType {
        match self {
            ProcedureArgs::Ramp(_) => ProcedureType::Ramp,
            ProcedureArgs::Scan(_) => ProcedureType::Scan,
            ProcedureArgs::Tune(_) => ProcedureType::Tune,
            ProcedureArgs::Auto(_) => ProcedureType::Auto,
            ProcedureArgs::Wipe => ProcedureType::Wipe,
        }
    }
}

/// A long-running device operation
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Kind of procedure this runs
    fn procedure_type(&self) -> ProcedureType;

    /// Run until done or until `cancel` fires
    async fn execute(
        &self,
        device: &SonicDevice,
        args: &ProcedureArgs,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError>;
}

/// The procedures this device can run, ramp first
pub fn available_procedures(device: &SonicDevice) -> Vec<Arc<dyn Procedure>> {
    let mut procedures: Vec<Arc<dyn Procedure>> = Vec::new();
    if let Some(ramper) = ramper_for(device) {
        procedures.push(ramper);
    }
    for kind in [
        ProcedureType::Scan,
        ProcedureType::Tune,
        ProcedureType::Auto,
        ProcedureType::Wipe,
    ] {
        if RemoteProcedure::is_supported(device, kind) {
            procedures.push(Arc::new(RemoteProcedure::new(kind)));
        }
    }
    procedures
}

/// The firmware ramp if the device has one, else a host-driven ramp
pub fn ramper_for(device: &SonicDevice) -> Option<Arc<dyn Procedure>> {
    if RamperRemote::is_supported(device) {
        Some(Arc::new(RamperRemote))
    } else if RamperLocal::is_supported(device) {
        Some(Arc::new(RamperLocal))
    } else {
        None
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), DeviceError> {
    if cancel.is_cancelled() {
        Err(DeviceError::Cancelled)
    } else {
        Ok(())
    }
}

/// Execute a step of a procedure; a refused command fails the procedure
async fn step(
    device: &SonicDevice,
    command: Command,
    cancel: &CancellationToken,
) -> Result<Answer, DeviceError> {
    check_cancelled(cancel)?;
    device.execute_checked(command).await
}

/// Turn the signal off after a procedure ended early
pub(crate) async fn release_signal(device: &SonicDevice) {
    if !device.is_connected() {
        return;
    }
    if let Err(e) = device.set_signal_off().await {
        debug!(error = %e, "could not switch signal off");
    }
}
