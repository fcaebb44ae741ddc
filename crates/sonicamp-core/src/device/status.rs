//! Device status and info
//!
//! [`Status`] holds the latest value of every status field the active
//! command table can populate. Updates are compared field by field; only
//! real changes are recorded, and an update older than the current
//! timestamp is rejected as a whole.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::events::{Event, EventBus};
use crate::protocol::{CommunicationMode, DeviceType, Field, RelayMode, Value, ValueDict, Version};

/// Outcome of one [`Status::update`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    /// Fields whose value changed
    pub changed: Vec<Field>,
    /// The procedure id left a non-zero value
    pub procedure_finished: bool,
}

/// Snapshot of the amplifier state
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    fields: BTreeSet<Field>,
    values: ValueDict,
    time_stamp: Option<DateTime<Utc>>,
    changed_data: Vec<Field>,
}

impl Status {
    /// Status tracking exactly `fields`
    pub fn new(fields: BTreeSet<Field>) -> Self {
        Self {
            fields,
            values: ValueDict::new(),
            time_stamp: None,
            changed_data: Vec::new(),
        }
    }

    /// Apply the status fields of `values` observed at `time_stamp`
    pub fn update(&mut self, values: &ValueDict, time_stamp: DateTime<Utc>) -> StatusUpdate {
        if let Some(current) = self.time_stamp {
            if time_stamp < current {
                debug!(%time_stamp, %current, "ignoring stale status update");
                return StatusUpdate::default();
            }
        }

        let mut update = StatusUpdate::default();
        for (field, value) in values {
            if !field.is_status() || !self.fields.contains(field) {
                continue;
            }
            let old = self.values.get(field);
            if old == Some(value) {
                continue;
            }
            if *field == Field::Procedure {
                let old_id = old.and_then(Value::as_i64).unwrap_or(0);
                if old_id != 0 && value.as_i64() != Some(old_id) {
                    update.procedure_finished = true;
                }
            }
            update.changed.push(*field);
            self.values.insert(*field, value.clone());
        }

        self.time_stamp = Some(time_stamp);
        self.changed_data = update.changed.clone();
        update
    }

    /// Fields this device reports
    pub fn fields(&self) -> &BTreeSet<Field> {
        &self.fields
    }

    /// Every value seen so far
    pub fn values(&self) -> &ValueDict {
        &self.values
    }

    /// Current value of `field`
    pub fn get(&self, field: Field) -> Option<&Value> {
        self.values.get(&field)
    }

    /// When the last update was applied
    pub fn time_stamp(&self) -> Option<DateTime<Utc>> {
        self.time_stamp
    }

    /// Fields changed by the last update
    pub fn changed_data(&self) -> &[Field] {
        &self.changed_data
    }

    /// Frequency in Hz
    pub fn frequency(&self) -> Option<i64> {
        self.get(Field::Frequency)?.as_i64()
    }

    /// Gain in percent
    pub fn gain(&self) -> Option<i64> {
        self.get(Field::Gain)?.as_i64()
    }

    /// Temperature in °C
    pub fn temperature(&self) -> Option<f64> {
        self.get(Field::Temperature)?.as_f64()
    }

    /// Voltage in mV
    pub fn urms(&self) -> Option<f64> {
        self.get(Field::Urms)?.as_f64()
    }

    /// Current in mA
    pub fn irms(&self) -> Option<f64> {
        self.get(Field::Irms)?.as_f64()
    }

    /// Phase in degrees
    pub fn phase(&self) -> Option<f64> {
        self.get(Field::Phase)?.as_f64()
    }

    /// Whether the output is on
    pub fn signal(&self) -> Option<bool> {
        self.get(Field::Signal)?.as_bool()
    }

    /// Id of the running remote procedure, 0 when idle
    pub fn procedure(&self) -> Option<i64> {
        self.get(Field::Procedure)?.as_i64()
    }

    /// Relay position (kHz or MHz)
    pub fn relay_mode(&self) -> Option<RelayMode> {
        match self.get(Field::RelayMode)? {
            Value::RelayMode(mode) => Some(*mode),
            _ => None,
        }
    }

    /// Who controls the device
    pub fn communication_mode(&self) -> Option<CommunicationMode> {
        match self.get(Field::CommunicationMode)? {
            Value::CommunicationMode(mode) => Some(*mode),
            _ => None,
        }
    }

    /// Calibration frequency of channel `index`
    pub fn atf(&self, index: u8) -> Option<i64> {
        self.get(Field::Atf(index))?.as_i64()
    }

    /// Calibration coefficient of channel `index`
    pub fn atk(&self, index: u8) -> Option<f64> {
        self.get(Field::Atk(index))?.as_f64()
    }

    /// Calibration temperature of channel `index`
    pub fn att(&self, index: u8) -> Option<f64> {
        self.get(Field::Att(index))?.as_f64()
    }

    /// Calibration on time of channel `index`, in ms
    pub fn aton(&self, index: u8) -> Option<i64> {
        self.get(Field::Aton(index))?.as_i64()
    }
}

/// Shared status with change signals.
///
/// `changed` and `procedure_finished` are generation counters: every
/// change bumps the counter, so a watcher never misses a pulse.
pub struct StatusHandle {
    status: Mutex<Status>,
    changed: watch::Sender<u64>,
    procedure_finished: watch::Sender<u64>,
    events: EventBus,
}

impl StatusHandle {
    /// Handle publishing changes of `status` to `events`
    pub fn new(status: Status, events: EventBus) -> Self {
        Self {
            status: Mutex::new(status),
            changed: watch::channel(0).0,
            procedure_finished: watch::channel(0).0,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an update and pulse the signals it triggers
    pub fn update(&self, values: &ValueDict, time_stamp: DateTime<Utc>) -> StatusUpdate {
        let update = self.lock().update(values, time_stamp);
        if !update.changed.is_empty() {
            self.changed.send_modify(|generation| *generation += 1);
            self.events.emit(Event::StatusChanged {
                changed: update.changed.clone(),
            });
        }
        if update.procedure_finished {
            debug!("remote procedure finished");
            self.procedure_finished
                .send_modify(|generation| *generation += 1);
        }
        update
    }

    /// Copy of the current status
    pub fn snapshot(&self) -> Status {
        self.lock().clone()
    }

    /// Read the status without copying it
    pub fn with<R>(&self, f: impl FnOnce(&Status) -> R) -> R {
        f(&self.lock())
    }

    /// Bumped on every status change
    pub fn subscribe_changed(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Bumped whenever a remote procedure finishes
    pub fn subscribe_procedure_finished(&self) -> watch::Receiver<u64> {
        self.procedure_finished.subscribe()
    }
}

/// Identity of the device, fixed after the handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Info {
    /// Product line
    pub device_type: DeviceType,
    /// `None` when the device did not report it
    pub firmware_version: Option<Version>,
    /// Protocol version agreed in the handshake
    pub protocol_version: Version,
    /// Release or debug firmware build
    pub is_release: bool,
    /// Extra lines of the `?info` answer
    pub firmware_info: String,
}
