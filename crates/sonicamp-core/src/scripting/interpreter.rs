//! Script interpreter
//!
//! Steps through a [`Script`] one statement at a time. Loop counters live in
//! a working copy of the script's loop marks; when a loop is exhausted its
//! whole range is restored from the pristine marks so the loop runs its full
//! count again on the next entry.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::parser::{LoopMark, Script, ScriptCommand};
use super::ScriptError;
use crate::device::{DeviceError, SonicDevice};
use crate::procedures::{hold, ramper_for, ProcedureArgs};
use crate::protocol::{Answer, Command, CommandCode};

/// A finished statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Source line (1-based)
    pub line: usize,
    /// Human readable description of what ran
    pub task: String,
}

/// Steps through a parsed script on a device
pub struct Interpreter {
    device: SonicDevice,
    script: Script,
    loops: Vec<LoopMark>,
    current: usize,
}

impl Interpreter {
    /// Interpreter positioned at the first statement
    pub fn new(device: SonicDevice, script: Script) -> Self {
        Self {
            device,
            loops: script.loops.clone(),
            script,
            current: 0,
        }
    }

    /// The script being run
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Source line of the next statement, if any remain
    pub fn current_line(&self) -> Option<usize> {
        self.script.statements.get(self.current).map(|s| s.line)
    }

    /// Whether every statement has run
    pub fn is_finished(&self) -> bool {
        self.current >= self.script.len()
    }

    /// Rewind to the first statement with fresh loop counters
    pub fn reset(&mut self) {
        self.current = 0;
        self.loops = self.script.loops.clone();
    }

    /// Execute the next statement.
    ///
    /// Returns `None` once the script has run to the end. A cancelled or
    /// failed statement leaves the position unchanged, so it runs again on
    /// the next call.
    pub async fn next_step(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<Step, ScriptError>> {
        let statement = self.script.statements.get(self.current)?.clone();
        let task = statement.command.to_string();
        debug!(line = statement.line, %task, "script step");

        let next = match statement.command {
            ScriptCommand::StartLoop(_) => self.enter_loop(),
            ScriptCommand::EndLoop => match self.loops[self.current] {
                LoopMark::End { begin } => begin,
                _ => self.current + 1,
            },
            ref command => match self.run(command, cancel).await {
                Ok(()) => self.current + 1,
                Err(source) => {
                    return Some(Err(ScriptError::Runtime {
                        line: statement.line,
                        source,
                    }))
                }
            },
        };
        self.current = next;
        Some(Ok(Step {
            line: statement.line,
            task,
        }))
    }

    fn enter_loop(&mut self) -> usize {
        let begin = self.current;
        let (end, quantifier) = match self.loops[begin] {
            LoopMark::Begin { end, quantifier } => (end, quantifier),
            _ => return begin + 1,
        };
        match quantifier {
            -1 => begin + 1,
            n if n > 0 => {
                self.loops[begin] = LoopMark::Begin {
                    end,
                    quantifier: n - 1,
                };
                begin + 1
            }
            _ => {
                self.loops[begin..=end].copy_from_slice(&self.script.loops[begin..=end]);
                end + 1
            }
        }
    }

    async fn run(
        &self,
        command: &ScriptCommand,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        if cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        let device = &self.device;
        match command {
            ScriptCommand::Frequency(frequency) => {
                self.send(Command::new(CommandCode::SetFrequency).with_value(*frequency))
                    .await
            }
            ScriptCommand::Gain(gain) => {
                self.send(Command::new(CommandCode::SetGain).with_value(*gain))
                    .await
            }
            ScriptCommand::On => acknowledged("!ON", device.set_signal_on().await?),
            ScriptCommand::Off => acknowledged("!OFF", device.set_signal_off().await?),
            ScriptCommand::Auto => {
                let code = if device.has_command(CommandCode::SetAuto) {
                    CommandCode::SetAuto
                } else {
                    CommandCode::Auto
                };
                self.send(code.into()).await
            }
            ScriptCommand::Hold(duration) => hold(*duration, cancel).await,
            ScriptCommand::RampFreq(args) => {
                let ramper = ramper_for(device)
                    .ok_or_else(|| DeviceError::ProcedureUnsupported("ramp".to_string()))?;
                ramper
                    .execute(device, &ProcedureArgs::Ramp(*args), cancel)
                    .await
            }
            ScriptCommand::StartLoop(_) | ScriptCommand::EndLoop => Ok(()),
        }
    }

    /// Requests are never abandoned half-written; cancellation is honoured
    /// before the request and at every hold
    async fn send(&self, command: Command) -> Result<(), DeviceError> {
        self.device.execute_checked(command).await.map(|_| ())
    }
}

fn acknowledged(request: &str, answer: Answer) -> Result<(), DeviceError> {
    if answer.valid {
        Ok(())
    } else {
        Err(DeviceError::InvalidAnswer {
            request: request.to_string(),
            answer: answer.message,
        })
    }
}
