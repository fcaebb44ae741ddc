//! Command executor
//!
//! Builds request strings from typed commands, sends them through the
//! communicator and validates the reply against the command's answer
//! definition.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::answer::{Answer, AnswerDef};
use super::commands::{Command, CommandCode};
use super::communicator::Communicator;
use super::registry::CommandLookUp;
use crate::device::DeviceError;

/// One executed request, as handed to the command call log
#[derive(Debug, Clone, Serialize)]
pub struct CommandCallRecord {
    /// When the answer arrived
    pub timestamp: DateTime<Utc>,
    /// Request as sent
    pub request: String,
    /// Raw answer text
    pub answer: String,
    /// Time from request to answer
    pub round_trip_ms: u64,
    /// Whether the answer passed validation
    pub valid: bool,
}

impl CommandCallRecord {
    /// One line of the call log
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Callback receiving every executed request
pub type CommandCallLog = Arc<dyn Fn(&CommandCallRecord) + Send + Sync>;

/// Sends commands and turns replies into [`Answer`]s
#[derive(Clone)]
pub struct CommandExecutor {
    communicator: Arc<Communicator>,
    call_log: Option<CommandCallLog>,
}

impl CommandExecutor {
    /// Executor sending through `communicator`
    pub fn new(communicator: Arc<Communicator>) -> Self {
        Self {
            communicator,
            call_log: None,
        }
    }

    /// Record every call to `call_log`
    pub fn with_call_log(mut self, call_log: CommandCallLog) -> Self {
        self.call_log = Some(call_log);
        self
    }

    /// Communicator requests go through
    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.communicator
    }

    /// Send a typed command and validate the answer
    pub async fn send_command(
        &self,
        command: &Command,
        lookup: &CommandLookUp,
    ) -> Result<Answer, DeviceError> {
        let request = lookup
            .command_def
            .request(command)
            .map_err(DeviceError::InvalidArgument)?;
        self.send_request(&request, Some(&lookup.answer_def)).await
    }

    /// Send a raw request without validation
    pub async fn send_message(&self, message: &str) -> Result<Answer, DeviceError> {
        self.send_request(message, None).await
    }

    /// Send `request` and validate the reply if an answer definition is given
    pub async fn send_request(
        &self,
        request: &str,
        answer_def: Option<&AnswerDef>,
    ) -> Result<Answer, DeviceError> {
        let started = Instant::now();
        let message = self
            .communicator
            .send_and_wait_for_response(request)
            .await?;
        let round_trip = started.elapsed();

        let answer = match answer_def {
            Some(answer_def) => validate(&message, answer_def, round_trip),
            None => {
                let (code, body) = split_code(&message);
                let mut answer = Answer::unvalidated(body.unwrap_or(&message), round_trip);
                answer.command_code = code;
                answer
            }
        };

        if answer_def.is_some() && !answer.valid {
            warn!(request, answer = %answer.message, unknown = ?answer.unknown_answers, "answer did not validate");
        } else {
            debug!(request, answer = %answer.message, round_trip_ms = round_trip.as_millis() as u64, "command executed");
        }

        if let Some(call_log) = &self.call_log {
            call_log(&CommandCallRecord {
                timestamp: answer.received_at,
                request: request.to_string(),
                answer: answer.message.clone(),
                round_trip_ms: round_trip.as_millis() as u64,
                valid: answer.valid,
            });
        }
        Ok(answer)
    }
}

/// Split a leading `<code>#` off an answer if `code` names a known command
fn split_code(message: &str) -> (Option<CommandCode>, Option<&str>) {
    let Some((head, rest)) = message.split_once('#') else {
        return (None, None);
    };
    match head.trim().parse::<u16>().ok().and_then(CommandCode::from_id) {
        Some(code) => (Some(code), Some(rest)),
        None => (None, None),
    }
}

fn validate(message: &str, answer_def: &AnswerDef, round_trip: std::time::Duration) -> Answer {
    let validation = answer_def.validate(message);
    if validation.valid {
        return Answer::validated(message, validation, round_trip);
    }

    // Retry without an echoed command code; keep the original if that fails too
    if let (Some(code), Some(body)) = split_code(message) {
        let stripped = answer_def.validate(body);
        if stripped.valid {
            let mut answer = Answer::validated(body, stripped, round_trip);
            answer.command_code = Some(code);
            return answer;
        }
    }
    Answer::validated(message, validation, round_trip)
}
