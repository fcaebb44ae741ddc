//! Procedure controller
//!
//! Runs at most one procedure per device. The procedure executes in its
//! own task with a token derived from the device token, so disconnecting
//! the device stops it too.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{available_procedures, Procedure, ProcedureArgs, ProcedureType};
use crate::device::{DeviceError, SonicDevice};
use crate::events::Event;

struct Running {
    kind: ProcedureType,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), DeviceError>>,
}

/// Starts, stops and tracks procedures of one device
pub struct ProcedureController {
    device: SonicDevice,
    procedures: BTreeMap<u8, Arc<dyn Procedure>>,
    running: Mutex<Option<Running>>,
}

impl ProcedureController {
    /// Idle controller for `device`
    pub fn new(device: SonicDevice) -> Self {
        let procedures = available_procedures(&device)
            .into_iter()
            .map(|procedure| (procedure.procedure_type() as u8, procedure))
            .collect();
        Self {
            device,
            procedures,
            running: Mutex::new(None),
        }
    }

    /// Device the procedures run on
    pub fn device(&self) -> &SonicDevice {
        &self.device
    }

    /// Procedures this device supports
    pub fn supported(&self) -> Vec<ProcedureType> {
        ProcedureType::ALL
            .into_iter()
            .filter(|kind| self.procedures.contains_key(&(*kind as u8)))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a procedure is running
    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Kind of the running procedure, if any
    pub fn running_procedure(&self) -> Option<ProcedureType> {
        self.lock()
            .as_ref()
            .filter(|running| !running.task.is_finished())
            .map(|running| running.kind)
    }

    /// Start a procedure in the background
    pub fn execute(&self, args: ProcedureArgs) -> Result<(), DeviceError> {
        let kind = args.procedure_type();
        let procedure = self
            .procedures
            .get(&(kind as u8))
            .cloned()
            .ok_or_else(|| DeviceError::ProcedureUnsupported(kind.to_string()))?;

        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(DeviceError::ProcedureAlreadyRunning);
        }

        let cancel = self.device.cancellation_token().child_token();
        let device = self.device.clone();
        let token = cancel.clone();
        let events = device.events().clone();
        events.emit(Event::ProcedureRunning {
            procedure: kind.to_string(),
        });
        info!(procedure = %kind, "procedure started");

        let task = tokio::spawn(async move {
            let result = procedure.execute(&device, &args, &token).await;
            match &result {
                Ok(()) => info!(procedure = %kind, "procedure finished"),
                Err(DeviceError::Cancelled) => info!(procedure = %kind, "procedure cancelled"),
                Err(e) => error!(procedure = %kind, error = %e, "procedure failed"),
            }
            events.emit(Event::ProcedureStopped);
            result
        });

        *running = Some(Running { kind, cancel, task });
        Ok(())
    }

    /// Cancel the running procedure and wait for it to wind down
    pub async fn stop(&self) {
        let running = self.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
        }
    }

    /// Wait for the running procedure and return its outcome
    pub async fn wait(&self) -> Result<(), DeviceError> {
        let running = self.lock().take();
        match running {
            Some(running) => match running.task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "procedure task aborted");
                    Err(DeviceError::Cancelled)
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for ProcedureController {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.cancel.cancel();
        }
    }
}
