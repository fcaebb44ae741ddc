//! Protocol commands
//!
//! Defines the commands understood by sonicamp firmware and how a typed
//! [`Command`] is turned into its request string (`alias[index][=value]`).

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Stable identifier of every command the core knows.
///
/// The discriminant is the code a device may echo in front of an answer
/// (`<code>#<answer>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandCode {
    /// `?` overview of everything the device reports
    GetOverview = 1,
    /// `?info`
    GetInfo = 2,
    /// `?type`
    GetType = 3,
    /// `?protocol`
    GetProtocol = 4,
    /// `?list_commands`
    ListCommands = 5,
    /// `?update` full status update
    GetUpdate = 6,
    /// `-` compact status
    GetStatus = 7,
    /// `?sens` sensor readings
    GetSens = 8,
    /// `?f`
    GetFrequency = 9,
    /// `?g`
    GetGain = 10,
    /// `?uipt` voltage, current and phase
    GetUipt = 11,
    /// `?pzt` transducer readings
    GetPzt = 12,
    /// `?atf<n>` calibration frequency
    GetAtf = 13,
    /// `?atk<n>` calibration coefficient
    GetAtk = 14,
    /// `?att<n>` calibration temperature
    GetAtt = 15,
    /// `?aton<n>` calibration on time
    GetAton = 16,

    /// `!ON`
    SetOn = 20,
    /// `!OFF`
    SetOff = 21,
    /// `!AUTO`
    SetAuto = 22,
    /// `!SERIAL`
    SetSerialMode = 23,
    /// `!ANALOG`
    SetAnalogMode = 24,
    /// `!KHZ` relay
    SetKhz = 25,
    /// `!MHZ` relay
    SetMhz = 26,
    /// `!f=<hz>`
    SetFrequency = 27,
    /// `!g=<percent>`
    SetGain = 28,
    /// `!swf=<n>` switching frequency
    SetSwf = 29,
    /// `!atf<n>=<hz>`
    SetAtf = 30,
    /// `!atk<n>=<coefficient>`
    SetAtk = 31,
    /// `!att<n>=<celsius>`
    SetAtt = 32,
    /// `!aton<n>=<ms>`
    SetAton = 33,

    /// `!scan` remote procedure
    Scan = 40,
    /// `!tune` remote procedure
    Tune = 41,
    /// `!auto` remote procedure
    Auto = 42,
    /// `!wipe` remote procedure
    Wipe = 43,
    /// `!ramp=start,stop,step,on,off`
    Ramp = 44,
    /// `!scan_gain=`
    SetScanGain = 45,
    /// `!scan_f_range=`
    SetScanFRange = 46,
    /// `!scan_f_step=`
    SetScanFStep = 47,
    /// `!scan_t_step=`
    SetScanTStep = 48,
    /// `!tune_f_step=`
    SetTuneFStep = 49,
    /// `!tune_t_time=`
    SetTuneTTime = 50,
    /// `!tune_t_step=`
    SetTuneTStep = 51,
}

impl CommandCode {
    /// All codes in id order
    pub const ALL: [CommandCode; 42] = [
        CommandCode::GetOverview,
        CommandCode::GetInfo,
        CommandCode::GetType,
        CommandCode::GetProtocol,
        CommandCode::ListCommands,
        CommandCode::GetUpdate,
        CommandCode::GetStatus,
        CommandCode::GetSens,
        CommandCode::GetFrequency,
        CommandCode::GetGain,
        CommandCode::GetUipt,
        CommandCode::GetPzt,
        CommandCode::GetAtf,
        CommandCode::GetAtk,
        CommandCode::GetAtt,
        CommandCode::GetAton,
        CommandCode::SetOn,
        CommandCode::SetOff,
        CommandCode::SetAuto,
        CommandCode::SetSerialMode,
        CommandCode::SetAnalogMode,
        CommandCode::SetKhz,
        CommandCode::SetMhz,
        CommandCode::SetFrequency,
        CommandCode::SetGain,
        CommandCode::SetSwf,
        CommandCode::SetAtf,
        CommandCode::SetAtk,
        CommandCode::SetAtt,
        CommandCode::SetAton,
        CommandCode::Scan,
        CommandCode::Tune,
        CommandCode::Auto,
        CommandCode::Wipe,
        CommandCode::Ramp,
        CommandCode::SetScanGain,
        CommandCode::SetScanFRange,
        CommandCode::SetScanFStep,
        CommandCode::SetScanTStep,
        CommandCode::SetTuneFStep,
        CommandCode::SetTuneTTime,
        CommandCode::SetTuneTStep,
    ];

    /// Numeric code used on the wire
    pub fn id(&self) -> u16 {
        *self as u16
    }

    /// Code for a numeric id, if it is known
    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.id() == id)
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Typed argument of a setter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetterValue {
    /// Whole number
    Int(i64),
    /// Decimal number
    Float(f64),
    /// Free text
    Text(String),
}

impl fmt::Display for SetterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetterValue::Int(v) => write!(f, "{v}"),
            SetterValue::Float(v) => write!(f, "{v}"),
            SetterValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for SetterValue {
    fn from(value: i64) -> Self {
        SetterValue::Int(value)
    }
}

impl From<u32> for SetterValue {
    fn from(value: u32) -> Self {
        SetterValue::Int(i64::from(value))
    }
}

impl From<f64> for SetterValue {
    fn from(value: f64) -> Self {
        SetterValue::Float(value)
    }
}

impl From<String> for SetterValue {
    fn from(value: String) -> Self {
        SetterValue::Text(value)
    }
}

impl From<&str> for SetterValue {
    fn from(value: &str) -> Self {
        SetterValue::Text(value.to_string())
    }
}

/// A command to execute, not yet bound to a protocol version
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// What to execute
    pub code: CommandCode,
    /// Channel for indexed commands (`!atf2=`)
    pub index: Option<u8>,
    /// Argument of a setter
    pub value: Option<SetterValue>,
}

impl Command {
    /// Command without index or argument
    pub fn new(code: CommandCode) -> Self {
        Self {
            code,
            index: None,
            value: None,
        }
    }

    /// Address channel `index`
    pub fn with_index(mut self, index: u8) -> Self {
        self.index = Some(index);
        self
    }

    /// Pass `value` as the setter argument
    pub fn with_value(mut self, value: impl Into<SetterValue>) -> Self {
        self.value = Some(value.into());
        self
    }
}

impl From<CommandCode> for Command {
    fn from(code: CommandCode) -> Self {
        Command::new(code)
    }
}

/// Kind of value a setter takes
#[derive(Debug, Clone, PartialEq)]
pub enum SetterKind {
    /// Integer within `min..=max`
    Int { min: i64, max: i64 },
    /// Accepts integers as well
    Float,
    /// Free text, sent as is
    Text,
}

impl SetterKind {
    /// Any integer
    pub const fn int() -> Self {
        SetterKind::Int {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    fn check(&self, value: &SetterValue) -> Result<(), String> {
        match (self, value) {
            (SetterKind::Int { min, max }, SetterValue::Int(v)) => {
                if (*min..=*max).contains(v) {
                    Ok(())
                } else {
                    Err(format!("{v} is outside {min}..={max}"))
                }
            }
            (SetterKind::Float, SetterValue::Int(_) | SetterValue::Float(_)) => Ok(()),
            (SetterKind::Text, SetterValue::Text(_)) => Ok(()),
            (kind, value) => Err(format!("{value} does not fit a {kind:?} setter")),
        }
    }
}

/// How a command is written on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDef {
    /// Command this definition writes
    pub code: CommandCode,
    /// Accepted spellings; the first one is sent
    pub aliases: Vec<&'static str>,
    /// Valid range of the index parameter, if the command takes one
    pub index: Option<RangeInclusive<u8>>,
    /// Argument accepted, `None` for plain commands
    pub setter: Option<SetterKind>,
}

impl CommandDef {
    /// Definition sending the first of `aliases`
    pub fn new(code: CommandCode, aliases: &[&'static str]) -> Self {
        Self {
            code,
            aliases: aliases.to_vec(),
            index: None,
            setter: None,
        }
    }

    /// Accept a channel index in `range`
    pub fn indexed(mut self, range: RangeInclusive<u8>) -> Self {
        self.index = Some(range);
        self
    }

    /// Make this a setter taking `kind`
    pub fn setter(mut self, kind: SetterKind) -> Self {
        self.setter = Some(kind);
        self
    }

    /// The alias that goes on the wire
    pub fn primary_alias(&self) -> &'static str {
        self.aliases.first().copied().unwrap_or_default()
    }

    /// Whether `alias` (without index or value) names this command
    pub fn matches_alias(&self, alias: &str) -> bool {
        self.aliases.iter().any(|a| *a == alias)
    }

    /// Build the request string `alias[index][=value]`
    pub fn request(&self, command: &Command) -> Result<String, String> {
        let mut request = self.primary_alias().to_string();

        match (&self.index, command.index) {
            (Some(range), Some(index)) if range.contains(&index) => {
                request.push_str(&index.to_string())
            }
            (Some(range), Some(index)) => {
                return Err(format!(
                    "{}: index {index} is outside {}..={}",
                    self.code,
                    range.start(),
                    range.end()
                ))
            }
            (Some(_), None) => return Err(format!("{}: index required", self.code)),
            (None, Some(_)) => return Err(format!("{}: takes no index", self.code)),
            (None, None) => {}
        }

        match (&self.setter, &command.value) {
            (Some(kind), Some(value)) => {
                kind.check(value)
                    .map_err(|e| format!("{}: {e}", self.code))?;
                request.push('=');
                request.push_str(&value.to_string());
            }
            (Some(_), None) => return Err(format!("{}: value required", self.code)),
            (None, Some(_)) => return Err(format!("{}: takes no value", self.code)),
            (None, None) => {}
        }
        Ok(request)
    }
}

/// Split a raw request into its alias, stripping `=value` and a trailing index
pub fn request_alias(request: &str) -> &str {
    let head = request
        .split_once('=')
        .map_or(request, |(head, _)| head)
        .trim();
    let stripped = head.trim_end_matches(|c: char| c.is_ascii_digit());
    if stripped.len() > 1 {
        stripped
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for code in CommandCode::ALL {
            assert_eq!(CommandCode::from_id(code.id()), Some(code));
        }
        assert_eq!(CommandCode::from_id(0), None);
        assert_eq!(CommandCode::from_id(1000), None);
    }

    #[test]
    fn test_request_strings() {
        let frequency = CommandDef::new(CommandCode::SetFrequency, &["!f", "!freq", "!frequency"])
            .setter(SetterKind::Int {
                min: 0,
                max: 10_000_000,
            });
        assert_eq!(
            frequency
                .request(&Command::new(CommandCode::SetFrequency).with_value(1_000_000i64))
                .unwrap(),
            "!f=1000000"
        );
        assert!(frequency
            .request(&Command::new(CommandCode::SetFrequency).with_value(-1i64))
            .is_err());
        assert!(frequency
            .request(&Command::new(CommandCode::SetFrequency))
            .is_err());

        let atk = CommandDef::new(CommandCode::SetAtk, &["!atk"])
            .indexed(1..=4)
            .setter(SetterKind::Float);
        assert_eq!(
            atk.request(&Command::new(CommandCode::SetAtk).with_index(2).with_value(1.5))
                .unwrap(),
            "!atk2=1.5"
        );
        assert!(atk
            .request(&Command::new(CommandCode::SetAtk).with_index(5).with_value(1.5))
            .is_err());

        let on = CommandDef::new(CommandCode::SetOn, &["!ON"]);
        assert_eq!(on.request(&Command::new(CommandCode::SetOn)).unwrap(), "!ON");
    }

    #[test]
    fn test_request_alias() {
        assert_eq!(request_alias("!f=1000"), "!f");
        assert_eq!(request_alias("!atf2=100"), "!atf");
        assert_eq!(request_alias("?atk1"), "?atk");
        assert_eq!(request_alias("?"), "?");
        assert_eq!(request_alias("-"), "-");
        assert_eq!(request_alias("!ramp=1,2,3,4,5"), "!ramp");
    }
}
