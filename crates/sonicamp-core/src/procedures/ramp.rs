//! Frequency ramps
//!
//! [`RamperLocal`] drives the ramp from the host, one `!f=` per step.
//! [`RamperRemote`] hands the whole ramp to firmware that has `!ramp`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::hold::hold;
use super::remote::await_remote_finish;
use super::{
    check_cancelled, release_signal, step, Procedure, ProcedureArgs, ProcedureType, RampArgs,
};
use crate::device::{DeviceError, SonicDevice};
use crate::protocol::{Command, CommandCode};

/// Values of a ramp, produced one at a time
#[derive(Debug, Clone)]
pub struct RampValues {
    next: Option<i64>,
    stop: i64,
    step: i64,
}

impl Iterator for RampValues {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let value = self.next?;
        let past_stop = if self.step > 0 {
            value > self.stop
        } else {
            value < self.stop
        };
        if past_stop {
            self.next = None;
            return None;
        }
        // Ends the ramp instead of wrapping at the i64 bounds
        self.next = value.checked_add(self.step);
        Some(value)
    }
}

/// Inclusive sequence from `start` towards `stop`.
///
/// The sign of `step` is taken from the direction of the ramp; `stop` is
/// included when a whole number of steps reaches it.
pub fn ramp_values(start: i64, stop: i64, step: i64) -> Result<RampValues, DeviceError> {
    if step == 0 {
        return Err(DeviceError::InvalidArgument(
            "ramp step must not be zero".to_string(),
        ));
    }
    let magnitude = step.checked_abs().ok_or_else(|| {
        DeviceError::InvalidArgument(format!("ramp step {step} is out of range"))
    })?;
    let step = if stop >= start { magnitude } else { -magnitude };
    Ok(RampValues {
        next: Some(start),
        stop,
        step,
    })
}

/// Reject ramps whose ends the device cannot be tuned to, before anything is sent
fn check_frequency_range(device: &SonicDevice, args: &RampArgs) -> Result<(), DeviceError> {
    let Some(lookup) = device.command_table().get(CommandCode::SetFrequency) else {
        return Ok(());
    };
    for end in [args.start, args.stop] {
        lookup
            .command_def
            .request(&Command::new(CommandCode::SetFrequency).with_value(end))
            .map_err(DeviceError::InvalidArgument)?;
    }
    Ok(())
}

fn ramp_args(args: &ProcedureArgs) -> Result<&RampArgs, DeviceError> {
    match args {
        ProcedureArgs::Ramp(ramp) => Ok(ramp),
        other => Err(DeviceError::InvalidArgument(format!(
            "ramp cannot run with {} arguments",
            other.procedure_type()
        ))),
    }
}

/// Ramp driven step by step from the host
pub struct RamperLocal;

impl RamperLocal {
    /// Whether the device has `!f=`, `!ON` and `!OFF`
    pub fn is_supported(device: &SonicDevice) -> bool {
        [
            CommandCode::SetFrequency,
            CommandCode::SetOn,
            CommandCode::SetOff,
        ]
        .iter()
        .all(|code| device.has_command(*code))
    }

    async fn run(
        &self,
        device: &SonicDevice,
        args: &RampArgs,
        values: RampValues,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let mut values = values.peekable();
        let pulsed = !args.hold_off.is_zero();

        if device.has_command(CommandCode::GetOverview) {
            check_cancelled(cancel)?;
            device.get_overview().await?;
        }
        if let Some(first) = values.peek() {
            step(
                device,
                Command::new(CommandCode::SetFrequency).with_value(*first),
                cancel,
            )
            .await?;
        }
        step(device, CommandCode::SetOn.into(), cancel).await?;

        for value in values {
            step(
                device,
                Command::new(CommandCode::SetFrequency).with_value(value),
                cancel,
            )
            .await?;
            if pulsed {
                step(device, CommandCode::SetOn.into(), cancel).await?;
            }
            hold(args.hold_on, cancel).await?;
            if pulsed {
                step(device, CommandCode::SetOff.into(), cancel).await?;
                hold(args.hold_off, cancel).await?;
            }
        }

        step(device, CommandCode::SetOff.into(), cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl Procedure for RamperLocal {
    fn procedure_type(&self) -> ProcedureType {
        ProcedureType::Ramp
    }

    async fn execute(
        &self,
        device: &SonicDevice,
        args: &ProcedureArgs,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let args = ramp_args(args)?;
        let values = ramp_values(args.start, args.stop, args.step)?;
        check_frequency_range(device, args)?;
        info!(start = args.start, stop = args.stop, step = args.step, "local ramp");
        let result = self.run(device, args, values, cancel).await;
        if result.is_err() {
            release_signal(device).await;
        }
        result
    }
}

/// Ramp executed by the firmware
pub struct RamperRemote;

impl RamperRemote {
    /// Whether the firmware runs `!ramp` and reports its progress
    pub fn is_supported(device: &SonicDevice) -> bool {
        device.has_command(CommandCode::Ramp) && device.command_table().can_report_procedure()
    }
}

#[async_trait]
impl Procedure for RamperRemote {
    fn procedure_type(&self) -> ProcedureType {
        ProcedureType::Ramp
    }

    async fn execute(
        &self,
        device: &SonicDevice,
        args: &ProcedureArgs,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let args = ramp_args(args)?;
        ramp_values(args.start, args.stop, args.step)?;
        check_frequency_range(device, args)?;
        let request = format!(
            "{},{},{},{},{}",
            args.start,
            args.stop,
            args.step,
            args.hold_on.as_millis(),
            args.hold_off.as_millis()
        );
        info!(%request, "remote ramp");

        let finished = device.status().subscribe_procedure_finished();
        let result = async {
            step(
                device,
                Command::new(CommandCode::Ramp).with_value(request),
                cancel,
            )
            .await?;
            await_remote_finish(device, finished, cancel).await
        }
        .await;
        if result.is_err() {
            release_signal(device).await;
        }
        result
    }
}
