//! Firmware procedures
//!
//! Scan, tune, auto and wipe run on the device. The host sets their
//! parameters, triggers them and then waits until the status `procedure`
//! field leaves the procedure's id, polling the status meanwhile.

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    release_signal, step, Procedure, ProcedureArgs, ProcedureType, ScanArgs, TuneArgs,
};
use crate::device::{DeviceError, SonicDevice};
use crate::protocol::{Command, CommandCode};

/// Wait until the device reports the end of the running procedure
pub async fn await_remote_finish(
    device: &SonicDevice,
    mut finished: watch::Receiver<u64>,
    cancel: &CancellationToken,
) -> Result<(), DeviceError> {
    let interval = device.config().procedure_poll_interval();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            changed = finished.changed() => {
                if changed.is_err() {
                    return Err(DeviceError::Cancelled);
                }
                debug!("remote procedure reported finished");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = device.poll_status().await {
                    if e.is_connection_error() {
                        return Err(e);
                    }
                    warn!(error = %e, "status poll during procedure failed");
                }
            }
        }
    }
}

fn trigger(kind: ProcedureType) -> CommandCode {
    match kind {
        ProcedureType::Scan => CommandCode::Scan,
        ProcedureType::Tune => CommandCode::Tune,
        ProcedureType::Auto => CommandCode::Auto,
        ProcedureType::Wipe => CommandCode::Wipe,
        ProcedureType::Ramp => CommandCode::Ramp,
    }
}

fn parameter_codes(kind: ProcedureType) -> &'static [CommandCode] {
    const SCAN: &[CommandCode] = &[
        CommandCode::SetScanGain,
        CommandCode::SetScanFRange,
        CommandCode::SetScanFStep,
        CommandCode::SetScanTStep,
    ];
    const TUNE: &[CommandCode] = &[
        CommandCode::SetTuneFStep,
        CommandCode::SetTuneTTime,
        CommandCode::SetTuneTStep,
    ];
    const AUTO: &[CommandCode] = &[
        CommandCode::SetScanGain,
        CommandCode::SetScanFRange,
        CommandCode::SetScanFStep,
        CommandCode::SetScanTStep,
        CommandCode::SetTuneFStep,
        CommandCode::SetTuneTTime,
        CommandCode::SetTuneTStep,
    ];
    match kind {
        ProcedureType::Scan => SCAN,
        ProcedureType::Tune => TUNE,
        ProcedureType::Auto => AUTO,
        ProcedureType::Wipe | ProcedureType::Ramp => &[],
    }
}

fn scan_parameters(args: &ScanArgs) -> Vec<Command> {
    vec![
        Command::new(CommandCode::SetScanGain).with_value(args.gain),
        Command::new(CommandCode::SetScanFRange).with_value(args.f_range),
        Command::new(CommandCode::SetScanFStep).with_value(args.f_step),
        Command::new(CommandCode::SetScanTStep).with_value(args.t_step.as_millis() as i64),
    ]
}

fn tune_parameters(args: &TuneArgs) -> Vec<Command> {
    vec![
        Command::new(CommandCode::SetTuneFStep).with_value(args.f_step),
        Command::new(CommandCode::SetTuneTTime).with_value(args.t_time.as_millis() as i64),
        Command::new(CommandCode::SetTuneTStep).with_value(args.t_step.as_millis() as i64),
    ]
}

/// A procedure the firmware runs by itself
pub struct RemoteProcedure {
    kind: ProcedureType,
}

impl RemoteProcedure {
    /// Procedure started by the firmware's `kind` command
    pub fn new(kind: ProcedureType) -> Self {
        Self { kind }
    }

    /// The device has the trigger, every parameter setter, and reports
    /// procedure ids in its status
    pub fn is_supported(device: &SonicDevice, kind: ProcedureType) -> bool {
        kind != ProcedureType::Ramp
            && device.has_command(trigger(kind))
            && parameter_codes(kind)
                .iter()
                .all(|code| device.has_command(*code))
            && device.command_table().can_report_procedure()
    }

    fn parameters(&self, args: &ProcedureArgs) -> Result<Vec<Command>, DeviceError> {
        match (self.kind, args) {
            (ProcedureType::Scan, ProcedureArgs::Scan(scan)) => Ok(scan_parameters(scan)),
            (ProcedureType::Tune, ProcedureArgs::Tune(tune)) => Ok(tune_parameters(tune)),
            (ProcedureType::Auto, ProcedureArgs::Auto(auto)) => {
                let mut parameters = scan_parameters(&auto.scan);
                parameters.extend(tune_parameters(&auto.tune));
                Ok(parameters)
            }
            (ProcedureType::Wipe, ProcedureArgs::Wipe) => Ok(Vec::new()),
            (kind, other) => Err(DeviceError::InvalidArgument(format!(
                "{kind} cannot run with {} arguments",
                other.procedure_type()
            ))),
        }
    }

    async fn run(
        &self,
        device: &SonicDevice,
        parameters: Vec<Command>,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        for parameter in parameters {
            step(device, parameter, cancel).await?;
        }
        let finished = device.status().subscribe_procedure_finished();
        step(device, trigger(self.kind).into(), cancel).await?;
        await_remote_finish(device, finished, cancel).await
    }
}

#[async_trait]
impl Procedure for RemoteProcedure {
    fn procedure_type(&self) -> ProcedureType {
        self.kind
    }

    async fn execute(
        &self,
        device: &SonicDevice,
        args: &ProcedureArgs,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let parameters = self.parameters(args)?;
        info!(procedure = %self.kind, "starting remote procedure");
        let result = self.run(device, parameters, cancel).await;
        if result.is_err() {
            release_signal(device).await;
        }
        result
    }
}
