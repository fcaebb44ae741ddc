//! Script engine
//!
//! Hosts an [`Interpreter`] in a background task and exposes its state as
//! observable properties. State and current line changes are published as
//! `PROPERTY_CHANGE` events, script failures as `INTERPRETATION_ERROR`.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::interpreter::Interpreter;
use super::parser::{parse_script, Script};
use super::ScriptError;
use crate::device::SonicDevice;
use crate::events::{Event, EventBus};
use crate::procedures::release_signal;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing running; `start` runs from the top
    Ready,
    /// A script task is executing
    Running,
    /// Stopped mid-script; `resume` continues at the current line
    Paused,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Ready => write!(f, "READY"),
            EngineState::Running => write!(f, "RUNNING"),
            EngineState::Paused => write!(f, "PAUSED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Continuous,
    SingleStep,
}

struct Shared {
    device: SonicDevice,
    events: EventBus,
    interpreter: tokio::sync::Mutex<Option<Interpreter>>,
    state: Mutex<EngineState>,
    current_line: Mutex<Option<usize>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, new: EngineState) {
        let old = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, new)
        };
        if old != new {
            self.events.emit(Event::PropertyChange {
                name: "state".to_string(),
                old: old.to_string(),
                new: new.to_string(),
            });
        }
    }

    fn set_current_line(&self, new: Option<usize>) {
        let old = {
            let mut line = self.current_line.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *line, new)
        };
        if old != new {
            let show = |line: Option<usize>| line.map(|l| l.to_string()).unwrap_or_default();
            self.events.emit(Event::PropertyChange {
                name: "current_line".to_string(),
                old: show(old),
                new: show(new),
            });
        }
    }
}

struct Run {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs scripts against a device
pub struct ScriptEngine {
    shared: Arc<Shared>,
    run: tokio::sync::Mutex<Option<Run>>,
}

impl ScriptEngine {
    /// Idle engine for `device`
    pub fn new(device: SonicDevice) -> Self {
        let events = device.events().clone();
        Self {
            shared: Arc::new(Shared {
                device,
                events,
                interpreter: tokio::sync::Mutex::new(None),
                state: Mutex::new(EngineState::Ready),
                current_line: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Device the scripts run against
    pub fn device(&self) -> &SonicDevice {
        &self.shared.device
    }

    /// Current run state
    pub fn state(&self) -> EngineState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Source line the engine executes next
    pub fn current_line(&self) -> Option<usize> {
        *self.shared.current_line.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Message of the error that last paused the script
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Parse and load a script
    pub async fn load_source(&self, text: &str) -> Result<(), ScriptError> {
        let script = parse_script(text)?;
        self.load(script).await
    }

    /// Replace the loaded script; refused while one runs
    pub async fn load(&self, script: Script) -> Result<(), ScriptError> {
        let run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(ScriptError::Busy);
        }
        let interpreter = Interpreter::new(self.shared.device.clone(), script);
        self.shared.set_current_line(interpreter.current_line());
        *self.shared.interpreter.lock().await = Some(interpreter);
        self.shared.set_state(EngineState::Ready);
        Ok(())
    }

    /// Run from the current line to the end
    pub async fn start(&self) -> Result<(), ScriptError> {
        self.launch(RunMode::Continuous).await
    }

    /// Run one statement, then pause
    pub async fn single_step(&self) -> Result<(), ScriptError> {
        self.launch(RunMode::SingleStep).await
    }

    /// Interrupt the running statement; it runs again on the next start
    pub async fn pause(&self) {
        if self.halt().await {
            self.shared.set_state(EngineState::Paused);
        }
    }

    /// Abort the script, rewind it and switch the signal off
    pub async fn stop(&self) {
        self.halt().await;
        if let Some(interpreter) = self.shared.interpreter.lock().await.as_mut() {
            interpreter.reset();
            self.shared.set_current_line(interpreter.current_line());
        }
        release_signal(&self.shared.device).await;
        self.shared.set_state(EngineState::Ready);
    }

    /// Wait for the running script to finish or pause
    pub async fn wait(&self) {
        let run = self.run.lock().await.take();
        if let Some(run) = run {
            let _ = run.task.await;
        }
    }

    async fn launch(&self, mode: RunMode) -> Result<(), ScriptError> {
        let mut run = self.run.lock().await;
        if run.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(ScriptError::Busy);
        }
        if self.shared.interpreter.lock().await.is_none() {
            return Err(ScriptError::NoScript);
        }

        let cancel = self.shared.device.cancellation_token().child_token();
        *self
            .shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.set_state(EngineState::Running);
        let task = tokio::spawn(run_script(self.shared.clone(), mode, cancel.clone()));
        *run = Some(Run { cancel, task });
        Ok(())
    }

    /// Cancel and await the run task; true if one was active
    async fn halt(&self) -> bool {
        let run = self.run.lock().await.take();
        match run {
            Some(run) => {
                let active = !run.task.is_finished();
                run.cancel.cancel();
                let _ = run.task.await;
                active
            }
            None => false,
        }
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().take() {
            run.cancel.cancel();
        }
    }
}

async fn run_script(shared: Arc<Shared>, mode: RunMode, cancel: CancellationToken) {
    let mut guard = shared.interpreter.lock().await;
    let Some(interpreter) = guard.as_mut() else {
        shared.set_state(EngineState::Ready);
        return;
    };

    loop {
        shared.set_current_line(interpreter.current_line());
        match interpreter.next_step(&cancel).await {
            None => {
                info!("script finished");
                interpreter.reset();
                shared.set_current_line(interpreter.current_line());
                drop(guard);
                release_signal(&shared.device).await;
                shared.set_state(EngineState::Ready);
                return;
            }
            Some(Ok(_)) if mode == RunMode::SingleStep => {
                shared.set_current_line(interpreter.current_line());
                shared.set_state(EngineState::Paused);
                return;
            }
            Some(Ok(_)) => tokio::task::yield_now().await,
            Some(Err(e)) if e.is_cancelled() => {
                shared.set_state(EngineState::Paused);
                return;
            }
            Some(Err(e)) => {
                warn!(error = %e, "script stopped");
                let message = e.to_string();
                *shared.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(message.clone());
                shared.events.emit(Event::InterpretationError { message });
                shared.set_state(EngineState::Paused);
                return;
            }
        }
    }
}
