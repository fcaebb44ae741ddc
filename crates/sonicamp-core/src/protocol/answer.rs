//! Answers and answer validation
//!
//! Device replies are parsed by regex validators whose named capture groups
//! map onto typed [`Field`]s. Each field carries a [`Converter`] that turns
//! the captured text into a [`Value`]; computed converters derive a value
//! from fields already converted (e.g. `signal = frequency != 0`).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use super::commands::CommandCode;
use super::registry::{DeviceType, Version};

/// Relay band of the amplifier output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Kilohertz relay
    Khz,
    /// Megahertz relay
    Mhz,
}

impl RelayMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "khz" => Some(RelayMode::Khz),
            "mhz" => Some(RelayMode::Mhz),
            _ => None,
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMode::Khz => write!(f, "khz"),
            RelayMode::Mhz => write!(f, "mhz"),
        }
    }
}

/// Where the amplifier takes its set points from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicationMode {
    /// Controlled over the serial link
    Serial,
    /// Controlled by the analog inputs
    Analog,
    /// Controlled from the front panel
    Manual,
}

impl CommunicationMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "serial" => Some(CommunicationMode::Serial),
            "analog" => Some(CommunicationMode::Analog),
            "manual" => Some(CommunicationMode::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for CommunicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationMode::Serial => write!(f, "serial"),
            CommunicationMode::Analog => write!(f, "analog"),
            CommunicationMode::Manual => write!(f, "manual"),
        }
    }
}

/// A named quantity a device answer can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Hz
    Frequency,
    /// Percent
    Gain,
    /// Degrees Celsius
    Temperature,
    /// mV
    Urms,
    /// mA
    Irms,
    /// Degrees
    Phase,
    /// Output on
    Signal,
    /// Running remote procedure id
    Procedure,
    /// Who controls the device
    CommunicationMode,
    /// Relay position (kHz or MHz)
    RelayMode,
    /// Calibration frequency of a channel
    Atf(u8),
    /// Calibration coefficient of a channel
    Atk(u8),
    /// Calibration temperature of a channel
    Att(u8),
    /// Calibration on time of a channel
    Aton(u8),
    /// Switching frequency
    Swf,
    /// Product line
    DeviceType,
    /// Firmware version, when reported separately
    FirmwareVersion,
    /// Protocol version
    ProtocolVersion,
    /// Release build flag
    IsRelease,
    /// Free text after the version line
    FirmwareInfo,
    /// Command codes listed by `?list_commands`
    Commands,
}

impl Field {
    /// Whether the field belongs to the device status (as opposed to info)
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            Field::Frequency
                | Field::Gain
                | Field::Temperature
                | Field::Urms
                | Field::Irms
                | Field::Phase
                | Field::Signal
                | Field::Procedure
                | Field::CommunicationMode
                | Field::RelayMode
                | Field::Atf(_)
                | Field::Atk(_)
                | Field::Att(_)
                | Field::Aton(_)
        )
    }

    /// Capture group name of a non-indexed field
    pub fn group_name(&self) -> &'static str {
        match self {
            Field::Frequency => "frequency",
            Field::Gain => "gain",
            Field::Temperature => "temperature",
            Field::Urms => "urms",
            Field::Irms => "irms",
            Field::Phase => "phase",
            Field::Signal => "signal",
            Field::Procedure => "procedure",
            Field::CommunicationMode => "communication_mode",
            Field::RelayMode => "relay_mode",
            Field::Atf(_) => "atf",
            Field::Atk(_) => "atk",
            Field::Att(_) => "att",
            Field::Aton(_) => "aton",
            Field::Swf => "swf",
            Field::DeviceType => "device_type",
            Field::FirmwareVersion => "firmware_version",
            Field::ProtocolVersion => "protocol_version",
            Field::IsRelease => "is_release",
            Field::FirmwareInfo => "firmware_info",
            Field::Commands => "commands",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Atf(k) | Field::Atk(k) | Field::Att(k) | Field::Aton(k) => {
                write!(f, "{}{}", self.group_name(), k)
            }
            _ => f.write_str(self.group_name()),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Per-channel calibration slots (index 1..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexedField {
    /// Calibration frequency
    Atf,
    /// Calibration coefficient
    Atk,
    /// Calibration temperature
    Att,
    /// Calibration on time
    Aton,
}

impl IndexedField {
    /// Number of channels
    pub const CHANNELS: u8 = 4;

    /// The [`Field`] for channel `index`
    pub fn field(&self, index: u8) -> Field {
        match self {
            IndexedField::Atf => Field::Atf(index),
            IndexedField::Atk => Field::Atk(index),
            IndexedField::Att => Field::Att(index),
            IndexedField::Aton => Field::Aton(index),
        }
    }

    fn group_name(&self) -> &'static str {
        self.field(1).group_name()
    }
}

/// A converted field value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Whole number
    Int(i64),
    /// Decimal number
    Float(f64),
    /// Flag
    Bool(bool),
    /// Text
    Text(String),
    /// Version number
    Version(Version),
    /// Device type
    DeviceType(DeviceType),
    /// Relay mode
    RelayMode(RelayMode),
    /// Communication mode
    CommunicationMode(CommunicationMode),
}

impl Value {
    /// Integer value; `None` for floats
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value as a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Flag value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Version(v) => write!(f, "{v}"),
            Value::DeviceType(v) => write!(f, "{v}"),
            Value::RelayMode(v) => write!(f, "{v}"),
            Value::CommunicationMode(v) => write!(f, "{v}"),
        }
    }
}

/// Field values parsed out of an answer
pub type ValueDict = BTreeMap<Field, Value>;

/// Turns captured text into a [`Value`]
#[derive(Debug, Clone, Copy)]
pub enum Converter {
    /// Integer
    Int,
    /// Float
    Float,
    /// Float multiplied by a factor (e.g. volts reported as mV)
    Scaled(f64),
    /// `on`/`off`, `true`/`false`, `1`/`0`
    Bool,
    /// Trimmed text
    Text,
    /// `major.minor.patch`
    Version,
    /// Device type name
    DeviceType,
    /// `khz`/`mhz`
    RelayMode,
    /// `serial`/`analog`/`manual`
    CommunicationMode,
    /// Derived from fields converted before it; has no capture group
    Computed(fn(&ValueDict) -> Option<Value>),
}

impl Converter {
    fn convert(&self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        match self {
            Converter::Int => raw.parse().ok().map(Value::Int),
            Converter::Float => raw.parse().ok().map(Value::Float),
            Converter::Scaled(factor) => raw.parse::<f64>().ok().map(|v| Value::Float(v * factor)),
            Converter::Bool => match raw.to_ascii_lowercase().as_str() {
                "on" | "true" | "1" | "yes" => Some(Value::Bool(true)),
                "off" | "false" | "0" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            Converter::Text => Some(Value::Text(raw.to_string())),
            Converter::Version => raw.parse().ok().map(Value::Version),
            Converter::DeviceType => raw.parse().ok().map(Value::DeviceType),
            Converter::RelayMode => RelayMode::parse(raw).map(Value::RelayMode),
            Converter::CommunicationMode => {
                CommunicationMode::parse(raw).map(Value::CommunicationMode)
            }
            Converter::Computed(_) => None,
        }
    }

    /// Regex fragment matching what this converter accepts
    fn sub_pattern(&self) -> &'static str {
        match self {
            Converter::Int => r"-?\d+",
            Converter::Float | Converter::Scaled(_) => r"-?\d+(?:\.\d+)?",
            Converter::Bool => r"[A-Za-z01]+",
            Converter::Text => r"[^#\n]*",
            Converter::Version => r"v?\d+\.\d+\.\d+",
            Converter::DeviceType | Converter::RelayMode | Converter::CommunicationMode => {
                r"[A-Za-z]+"
            }
            Converter::Computed(_) => "",
        }
    }
}

/// Where a converted value lands
#[derive(Debug, Clone, Copy)]
pub enum FieldSlot {
    /// Fixed field
    Plain(Field),
    /// Index taken from the `index` capture group
    Indexed(IndexedField),
}

/// One field of a validator
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    /// Where the value goes
    pub slot: FieldSlot,
    /// How the captured text is read
    pub converter: Converter,
}

impl FieldDef {
    /// Capture group named after `field`
    pub fn new(field: Field, converter: Converter) -> Self {
        Self {
            slot: FieldSlot::Plain(field),
            converter,
        }
    }

    /// Capture groups `<field>` and `index`
    pub fn indexed(field: IndexedField, converter: Converter) -> Self {
        Self {
            slot: FieldSlot::Indexed(field),
            converter,
        }
    }

    /// Value computed from the fields before it
    pub fn computed(field: Field, compute: fn(&ValueDict) -> Option<Value>) -> Self {
        Self::new(field, Converter::Computed(compute))
    }

    /// Every concrete field this definition can produce
    pub fn fields(&self) -> Vec<Field> {
        match self.slot {
            FieldSlot::Plain(field) => vec![field],
            FieldSlot::Indexed(indexed) => (1..=IndexedField::CHANNELS)
                .map(|k| indexed.field(k))
                .collect(),
        }
    }
}

/// Regex with named groups plus the converters for those groups
#[derive(Debug, Clone)]
pub struct AnswerValidator {
    regex: Regex,
    fields: Vec<FieldDef>,
}

impl AnswerValidator {
    /// Build a validator from a pattern that must match a whole line or answer.
    ///
    /// # Panics
    /// If `pattern` is not a valid regex. Validators are built from constant
    /// patterns; use [`AnswerValidator::try_new`] for anything else.
    pub fn new(pattern: &str, fields: Vec<FieldDef>) -> Self {
        Self::try_new(pattern, fields).expect("answer pattern is valid")
    }

    /// Like [`AnswerValidator::new`], returning the regex error
    pub fn try_new(pattern: &str, fields: Vec<FieldDef>) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!(r"^\s*(?:{pattern})\s*$"))?,
            fields,
        })
    }

    /// Build the pattern from the ordered fields, separated by `separator`.
    ///
    /// Computed fields take no position; indexed fields are not supported here.
    pub fn derived(fields: Vec<FieldDef>, separator: char) -> Self {
        let separator = regex::escape(&separator.to_string());
        let pattern = fields
            .iter()
            .filter_map(|def| match (def.slot, def.converter) {
                (_, Converter::Computed(_)) => None,
                (FieldSlot::Plain(field), converter) => Some(format!(
                    "(?P<{}>{})",
                    field.group_name(),
                    converter.sub_pattern()
                )),
                (FieldSlot::Indexed(_), _) => None,
            })
            .collect::<Vec<_>>()
            .join(&separator);
        Self::new(&pattern, fields)
    }

    /// Pattern as given, without the anchors
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Fields converted from each match, in order
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Match `text` and convert the captured fields.
    ///
    /// A capture that fails conversion makes the whole match fail. `known`
    /// holds values converted earlier in the same answer and is visible to
    /// computed fields.
    pub fn match_text(&self, text: &str, known: &ValueDict) -> Option<ValueDict> {
        let caps = self.regex.captures(text)?;
        let mut values = ValueDict::new();
        let mut computed = Vec::new();

        for def in &self.fields {
            match (def.slot, def.converter) {
                (FieldSlot::Plain(field), Converter::Computed(compute)) => {
                    computed.push((field, compute))
                }
                (FieldSlot::Plain(field), converter) => {
                    let Some(raw) = caps.name(field.group_name()) else {
                        continue;
                    };
                    values.insert(field, converter.convert(raw.as_str())?);
                }
                (FieldSlot::Indexed(indexed), converter) => {
                    let index: u8 = caps.name("index")?.as_str().parse().ok()?;
                    let raw = caps.name(indexed.group_name())?;
                    values.insert(indexed.field(index), converter.convert(raw.as_str())?);
                }
            }
        }

        if !computed.is_empty() {
            let mut visible = known.clone();
            visible.extend(values.iter().map(|(k, v)| (*k, v.clone())));
            for (field, compute) in computed {
                if let Some(value) = compute(&visible) {
                    visible.insert(field, value.clone());
                    values.insert(field, value);
                }
            }
        }
        Some(values)
    }
}

/// Result of validating one answer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    /// Values of every line that matched
    pub value_dict: ValueDict,
    /// Whether at least one validator matched
    pub valid: bool,
    /// Lines no validator matched
    pub unknown_answers: Vec<String>,
}

/// The set of validators an answer to one command is checked against
#[derive(Debug, Clone, Default)]
pub struct AnswerDef {
    validators: Vec<AnswerValidator>,
}

impl AnswerDef {
    /// Definition trying `validators` in order
    pub fn new(validators: Vec<AnswerValidator>) -> Self {
        Self { validators }
    }

    /// Definition with one validator
    pub fn single(validator: AnswerValidator) -> Self {
        Self::new(vec![validator])
    }

    /// Validators, in the order they are tried
    pub fn validators(&self) -> &[AnswerValidator] {
        &self.validators
    }

    /// Every field some validator can produce
    pub fn fields(&self) -> Vec<Field> {
        self.validators
            .iter()
            .flat_map(|v| v.fields().iter().flat_map(FieldDef::fields))
            .collect()
    }

    /// Validate an answer.
    ///
    /// The answer is valid when one validator matches it as a whole, or when
    /// every non-blank line matches at least one validator. Lines no
    /// validator accepts are returned as `unknown_answers`.
    pub fn validate(&self, text: &str) -> Validation {
        let trimmed = text.trim();
        let empty = ValueDict::new();
        for validator in &self.validators {
            if let Some(value_dict) = validator.match_text(trimmed, &empty) {
                return Validation {
                    value_dict,
                    valid: true,
                    unknown_answers: Vec::new(),
                };
            }
        }

        let mut validation = Validation::default();
        let mut matched_any = false;
        for line in trimmed.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let matched = self
                .validators
                .iter()
                .find_map(|v| v.match_text(line, &validation.value_dict));
            match matched {
                Some(values) => {
                    matched_any = true;
                    validation.value_dict.extend(values);
                }
                None => validation.unknown_answers.push(line.to_string()),
            }
        }
        validation.valid = matched_any && validation.unknown_answers.is_empty();
        validation
    }
}

/// A device reply
#[derive(Debug, Clone)]
pub struct Answer {
    /// Raw answer text (code prefix removed)
    pub message: String,
    /// Non-blank lines of the message
    pub lines: Vec<String>,
    /// Arrival time
    pub received_at: DateTime<Utc>,
    /// Time from request to answer
    pub round_trip: Duration,
    /// Whether the answer passed validation
    pub valid: bool,
    /// Values parsed from the answer
    pub value_dict: ValueDict,
    /// Lines that no validator matched
    pub unknown_answers: Vec<String>,
    /// Command code echoed by the device, if any
    pub command_code: Option<CommandCode>,
}

impl Answer {
    /// An answer that was not run through a validator
    pub fn unvalidated(message: impl Into<String>, round_trip: Duration) -> Self {
        let message = message.into();
        Self {
            lines: split_lines(&message),
            message,
            received_at: Utc::now(),
            round_trip,
            valid: false,
            value_dict: ValueDict::new(),
            unknown_answers: Vec::new(),
            command_code: None,
        }
    }

    /// An answer carrying the result of `validation`
    pub fn validated(
        message: impl Into<String>,
        validation: Validation,
        round_trip: Duration,
    ) -> Self {
        Self {
            valid: validation.valid,
            value_dict: validation.value_dict,
            unknown_answers: validation.unknown_answers,
            ..Self::unvalidated(message, round_trip)
        }
    }

    /// Parsed value of `field`
    pub fn get(&self, field: Field) -> Option<&Value> {
        self.value_dict.get(&field)
    }
}

fn split_lines(message: &str) -> Vec<String> {
    message
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
