//! Device builder
//!
//! Runs the handshake on a freshly opened communicator: identifies the
//! device type and protocol version, selects the command table for that
//! tuple and primes the status.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::status::{Info, Status};
use super::{DeviceError, SonicDevice};
use crate::config::DeviceConfig;
use crate::protocol::catalog::{legacy_lines, protocol_answer};
use crate::protocol::{
    Answer, AnswerDef, CommandCallLog, CommandCode, CommandExecutor, CommandLookUpTable,
    Communicator, DeviceType, Field, FrameProtocol, ProtocolRegistry, Value, ValueDict, Version,
    LEGACY_VERSIONS,
};

/// Builds a [`SonicDevice`] from a connected communicator
#[derive(Clone, Default)]
pub struct DeviceBuilder {
    config: DeviceConfig,
    registry: ProtocolRegistry,
    call_log: Option<CommandCallLog>,
}

impl DeviceBuilder {
    /// Builder with default settings and the built-in registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` for the built device
    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve commands against `registry` instead of the built-in one
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Offer every request of the session to `call_log`
    pub fn with_call_log(mut self, call_log: CommandCallLog) -> Self {
        self.call_log = Some(call_log);
        self
    }

    /// Run the handshake and assemble the session
    pub async fn build(&self, communicator: Arc<Communicator>) -> Result<SonicDevice, DeviceError> {
        if !communicator.connection_opened() {
            return Err(DeviceError::HandshakeFailed(
                "communicator is not open".to_string(),
            ));
        }

        let mut executor = CommandExecutor::new(communicator.clone());
        if let Some(call_log) = &self.call_log {
            executor = executor.with_call_log(call_log.clone());
        }

        let mut harvested = ValueDict::new();
        match communicator.protocol() {
            FrameProtocol::Legacy => {
                let config = communicator.config();
                let lines = communicator
                    .read_long_message(config.handshake_budget(), config.line_timeout())
                    .await?;
                let banner = AnswerDef::new(legacy_lines());
                for line in &lines {
                    merge_missing(&mut harvested, banner.validate(line).value_dict);
                }
                debug!(lines = lines.len(), "legacy banner read");
            }
            FrameProtocol::Framed => {
                let answer = executor
                    .send_request("?protocol", Some(&protocol_answer()))
                    .await?;
                if answer.valid {
                    merge_missing(&mut harvested, answer.value_dict);
                } else {
                    debug!(answer = %answer.message, "device does not report its protocol");
                }
            }
        }

        let identified = harvested.contains_key(&Field::DeviceType)
            && (harvested.contains_key(&Field::ProtocolVersion)
                || harvested.contains_key(&Field::FirmwareVersion));
        if !identified {
            self.deduce_from_legacy_queries(&executor, &mut harvested)
                .await?;
        }

        let device_type = match harvested.get(&Field::DeviceType) {
            Some(Value::DeviceType(device_type)) => *device_type,
            _ => DeviceType::Unknown,
        };
        let is_release = harvested
            .get(&Field::IsRelease)
            .and_then(Value::as_bool)
            .unwrap_or(self.config.is_release_default);
        let protocol_version = match (
            version_of(&harvested, Field::ProtocolVersion),
            version_of(&harvested, Field::FirmwareVersion),
        ) {
            (Some(version), _) | (None, Some(version)) => version,
            (None, None) => {
                warn!("device reported no version, assuming {}", LEGACY_VERSIONS[0]);
                LEGACY_VERSIONS[0]
            }
        };

        let table = self.registry.build(device_type, protocol_version, is_release);
        if !harvested.contains_key(&Field::FirmwareVersion) {
            self.query_firmware(&executor, &table, &mut harvested)
                .await?;
        }

        let info = Info {
            device_type,
            firmware_version: version_of(&harvested, Field::FirmwareVersion),
            protocol_version,
            is_release,
            firmware_info: harvested
                .get(&Field::FirmwareInfo)
                .map(ToString::to_string)
                .unwrap_or_default(),
        };
        info!(
            device_type = %info.device_type,
            protocol_version = %info.protocol_version,
            is_release,
            commands = table.len(),
            "device identified"
        );

        let status = Status::new(table.status_fields());
        let device = SonicDevice::from_parts(executor, table, status, info, self.config.clone());
        device.status().update(&harvested, Utc::now());

        if device.has_command(CommandCode::GetUpdate) {
            match device.get_update().await {
                Ok(answer) if !answer.valid => {
                    warn!(answer = %answer.message, "initial status update did not validate")
                }
                Ok(_) => {}
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => warn!(error = %e, "initial status update failed"),
            }
        }
        Ok(device)
    }

    /// Ask `?info`, `?type` and `?`, and keep whatever some legacy table
    /// can make sense of
    async fn deduce_from_legacy_queries(
        &self,
        executor: &CommandExecutor,
        harvested: &mut ValueDict,
    ) -> Result<(), DeviceError> {
        let (info, device_type, overview) = tokio::join!(
            executor.send_message("?info"),
            executor.send_message("?type"),
            executor.send_message("?"),
        );

        let tables: Vec<CommandLookUpTable> = LEGACY_VERSIONS
            .iter()
            .flat_map(|version| {
                DeviceType::ALL.iter().map(move |device_type| {
                    self.registry
                        .build(*device_type, *version, self.config.is_release_default)
                })
            })
            .collect();

        for (code, answer) in [
            (CommandCode::GetInfo, info),
            (CommandCode::GetType, device_type),
            (CommandCode::GetOverview, overview),
        ] {
            let answer = match answer {
                Ok(answer) => answer,
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => {
                    warn!(%code, error = %e, "handshake query failed");
                    continue;
                }
            };
            if let Some(values) = validate_with_any(&tables, code, &answer) {
                merge_missing(harvested, values);
            }
        }
        Ok(())
    }

    async fn query_firmware(
        &self,
        executor: &CommandExecutor,
        table: &CommandLookUpTable,
        harvested: &mut ValueDict,
    ) -> Result<(), DeviceError> {
        let Some(lookup) = table.get(CommandCode::GetInfo) else {
            return Ok(());
        };
        match executor
            .send_request(lookup.command_def.primary_alias(), Some(&lookup.answer_def))
            .await
        {
            Ok(answer) => merge_missing(harvested, answer.value_dict),
            Err(e) if e.is_connection_error() => return Err(e),
            Err(e) => warn!(error = %e, "firmware query failed"),
        }
        Ok(())
    }
}

fn validate_with_any(
    tables: &[CommandLookUpTable],
    code: CommandCode,
    answer: &Answer,
) -> Option<ValueDict> {
    tables
        .iter()
        .filter_map(|table| table.get(code))
        .map(|lookup| lookup.answer_def.validate(&answer.message))
        .find(|validation| validation.valid)
        .map(|validation| validation.value_dict)
}

fn merge_missing(harvested: &mut ValueDict, values: ValueDict) {
    for (field, value) in values {
        harvested.entry(field).or_insert(value);
    }
}

fn version_of(values: &ValueDict, field: Field) -> Option<Version> {
    match values.get(&field) {
        Some(Value::Version(version)) => Some(*version),
        _ => None,
    }
}
