//! Command catalog
//!
//! The answer formats of every firmware generation. Legacy firmware (before
//! 1.0) prints human readable lines; framed firmware answers `key=value`
//! lines or compact `#`-separated records.

use super::answer::{
    AnswerDef, AnswerValidator, Converter, Field, FieldDef, IndexedField, Value, ValueDict,
};
use super::commands::{CommandCode, CommandDef, SetterKind};
use super::registry::{
    BuildType, DeviceType, RegistryEntry, Version, VersionRange, FRAMED_VERSION,
};

const MAX_FREQUENCY: i64 = 10_000_000;
const MAX_GAIN: i64 = 150;

fn field(field: Field, converter: Converter) -> FieldDef {
    FieldDef::new(field, converter)
}

fn signal_from_frequency(values: &ValueDict) -> Option<Value> {
    let frequency = values.get(&Field::Frequency)?.as_i64()?;
    Some(Value::Bool(frequency != 0))
}

/// Lines printed by legacy firmware, in banners and as answers
pub(crate) fn legacy_lines() -> Vec<AnswerValidator> {
    vec![
        AnswerValidator::new(
            r"(?i)ver(?:sion)?:? (?P<firmware_version>v?\d+\.\d+\.\d+)",
            vec![field(Field::FirmwareVersion, Converter::Version)],
        ),
        AnswerValidator::new(
            r"(?i)(?P<device_type>sonic(?:catch|wipe|descale))",
            vec![field(Field::DeviceType, Converter::DeviceType)],
        ),
        AnswerValidator::new(
            r"(?i)signal:? (?P<signal>on|off)",
            vec![field(Field::Signal, Converter::Bool)],
        ),
        AnswerValidator::new(
            r"(?i)(?P<relay_mode>khz|mhz) mode",
            vec![field(Field::RelayMode, Converter::RelayMode)],
        ),
        AnswerValidator::new(
            r"(?i)(?P<communication_mode>serial|analog) mode",
            vec![field(Field::CommunicationMode, Converter::CommunicationMode)],
        ),
        AnswerValidator::new(
            r"(?i)freq(?:uency)?:? (?P<frequency>\d+)(?: ?hz)?",
            vec![field(Field::Frequency, Converter::Int)],
        ),
        AnswerValidator::new(
            r"(?i)gain:? (?P<gain>\d+)(?: ?%)?",
            vec![field(Field::Gain, Converter::Int)],
        ),
        AnswerValidator::new(
            r"(?i)temp(?:erature)?:? (?P<temperature>-?\d+(?:\.\d+)?)(?: ?c)?",
            vec![field(Field::Temperature, Converter::Float)],
        ),
        AnswerValidator::new(
            r"(?i)(?:firmware|build)(?: info)?:? (?P<firmware_info>.+)",
            vec![field(Field::FirmwareInfo, Converter::Text)],
        ),
    ]
}

/// `key=value` lines of framed firmware
pub(crate) fn v1_lines() -> Vec<AnswerValidator> {
    const NUMBER: &str = r"-?\d+(?:\.\d+)?";
    vec![
        AnswerValidator::new(
            r"freq(?:uency)?=(?P<frequency>\d+)(?: ?Hz)?",
            vec![field(Field::Frequency, Converter::Int)],
        ),
        AnswerValidator::new(
            r"gain=(?P<gain>\d+)(?: ?%)?",
            vec![field(Field::Gain, Converter::Int)],
        ),
        AnswerValidator::new(
            r"signal=(?P<signal>(?i:on|off|true|false|[01]))",
            vec![field(Field::Signal, Converter::Bool)],
        ),
        AnswerValidator::new(
            r"relay=(?P<relay_mode>(?i:khz|mhz))",
            vec![field(Field::RelayMode, Converter::RelayMode)],
        ),
        AnswerValidator::new(
            r"comm=(?P<communication_mode>(?i:serial|analog|manual))",
            vec![field(Field::CommunicationMode, Converter::CommunicationMode)],
        ),
        AnswerValidator::new(
            &format!(r"temp(?:erature)?=(?P<temperature>{NUMBER})(?: ?C)?"),
            vec![field(Field::Temperature, Converter::Float)],
        ),
        AnswerValidator::new(
            &format!(r"urms=(?P<urms>{NUMBER})(?: ?mV)?"),
            vec![field(Field::Urms, Converter::Float)],
        ),
        AnswerValidator::new(
            &format!(r"irms=(?P<irms>{NUMBER})(?: ?mA)?"),
            vec![field(Field::Irms, Converter::Float)],
        ),
        AnswerValidator::new(
            &format!(r"phase=(?P<phase>{NUMBER})(?: ?deg)?"),
            vec![field(Field::Phase, Converter::Float)],
        ),
        AnswerValidator::new(
            r"procedure=(?P<procedure>\d+)",
            vec![field(Field::Procedure, Converter::Int)],
        ),
        AnswerValidator::new(
            r"atf(?P<index>[1-4])=(?P<atf>\d+)",
            vec![FieldDef::indexed(IndexedField::Atf, Converter::Int)],
        ),
        AnswerValidator::new(
            &format!(r"atk(?P<index>[1-4])=(?P<atk>{NUMBER})"),
            vec![FieldDef::indexed(IndexedField::Atk, Converter::Float)],
        ),
        AnswerValidator::new(
            &format!(r"att(?P<index>[1-4])=(?P<att>{NUMBER})"),
            vec![FieldDef::indexed(IndexedField::Att, Converter::Float)],
        ),
        AnswerValidator::new(
            r"aton(?P<index>[1-4])=(?P<aton>\d+)",
            vec![FieldDef::indexed(IndexedField::Aton, Converter::Int)],
        ),
        AnswerValidator::new(
            r"swf=(?P<swf>\d+)",
            vec![field(Field::Swf, Converter::Int)],
        ),
        AnswerValidator::new(
            r"type=(?P<device_type>\w+)",
            vec![field(Field::DeviceType, Converter::DeviceType)],
        ),
        AnswerValidator::new(
            r"firmware=(?P<firmware_version>v?\d+\.\d+\.\d+)",
            vec![field(Field::FirmwareVersion, Converter::Version)],
        ),
        AnswerValidator::new(
            r"protocol=(?P<protocol_version>\d+\.\d+\.\d+)",
            vec![field(Field::ProtocolVersion, Converter::Version)],
        ),
        AnswerValidator::new(
            r"release=(?P<is_release>(?i:true|false|[01]))",
            vec![field(Field::IsRelease, Converter::Bool)],
        ),
        AnswerValidator::new(
            r"info=(?P<firmware_info>.*)",
            vec![field(Field::FirmwareInfo, Converter::Text)],
        ),
    ]
}

/// `<device type>#<protocol version>#<is release>`
pub(crate) fn protocol_answer() -> AnswerDef {
    AnswerDef::single(AnswerValidator::derived(
        vec![
            field(Field::DeviceType, Converter::DeviceType),
            field(Field::ProtocolVersion, Converter::Version),
            field(Field::IsRelease, Converter::Bool),
        ],
        '#',
    ))
}

fn v1_status_fields() -> Vec<FieldDef> {
    vec![
        field(Field::Frequency, Converter::Int),
        field(Field::Gain, Converter::Int),
        field(Field::Signal, Converter::Bool),
        field(Field::Procedure, Converter::Int),
        field(Field::Temperature, Converter::Float),
        field(Field::Urms, Converter::Float),
        field(Field::Irms, Converter::Float),
        field(Field::Phase, Converter::Float),
    ]
}

fn sens_fields(measurement: Converter) -> Vec<FieldDef> {
    vec![
        field(Field::Frequency, Converter::Int),
        field(Field::Urms, measurement),
        field(Field::Irms, measurement),
        field(Field::Phase, measurement),
    ]
}

/// Validator for a parameter setter that echoes `name=value`
fn echo(name: &str) -> AnswerDef {
    AnswerDef::single(AnswerValidator::new(
        &format!(r"{name}=-?\d+(?:\.\d+)?"),
        vec![],
    ))
}

fn frequency_setter() -> SetterKind {
    SetterKind::Int {
        min: 0,
        max: MAX_FREQUENCY,
    }
}

fn gain_setter() -> SetterKind {
    SetterKind::Int {
        min: 0,
        max: MAX_GAIN,
    }
}

fn legacy_entries() -> Vec<RegistryEntry> {
    use CommandCode::*;

    let lines = AnswerDef::new(legacy_lines());
    let legacy = VersionRange::legacy();
    let entry = |def: CommandDef, answer: AnswerDef| RegistryEntry::new(def, answer).versions(legacy);

    let mut type_validators = legacy_lines();
    type_validators.push(AnswerValidator::new(
        r"(?i)(?P<device_type>catch|wipe|descale)",
        vec![field(Field::DeviceType, Converter::DeviceType)],
    ));

    vec![
        entry(CommandDef::new(GetOverview, &["?"]), lines.clone()),
        entry(CommandDef::new(GetInfo, &["?info"]), lines.clone()),
        entry(CommandDef::new(GetType, &["?type"]), AnswerDef::new(type_validators)),
        entry(
            CommandDef::new(GetStatus, &["-"]),
            AnswerDef::single(AnswerValidator::derived(
                vec![
                    field(Field::Frequency, Converter::Int),
                    field(Field::Gain, Converter::Int),
                    field(Field::Temperature, Converter::Float),
                    FieldDef::computed(Field::Signal, signal_from_frequency),
                ],
                '-',
            )),
        ),
        // 0.4 reports full scale integers, 0.5 factorised volts/amps
        entry(
            CommandDef::new(GetSens, &["?sens"]),
            AnswerDef::single(AnswerValidator::derived(sens_fields(Converter::Int), ' ')),
        )
        .devices(&[DeviceType::Catch])
        .versions(VersionRange::between(
            Version::new(0, 4, 0),
            Version::new(0, 4, 99),
        )),
        entry(
            CommandDef::new(GetSens, &["?sens"]),
            AnswerDef::single(AnswerValidator::derived(
                sens_fields(Converter::Scaled(1000.0)),
                ' ',
            )),
        )
        .devices(&[DeviceType::Catch])
        .versions(VersionRange::between(
            Version::new(0, 5, 0),
            Version::new(0, 99, 99),
        )),
        entry(CommandDef::new(SetOn, &["!ON"]), lines.clone()),
        entry(CommandDef::new(SetOff, &["!OFF"]), lines.clone()),
        entry(
            CommandDef::new(SetAuto, &["!AUTO"]),
            AnswerDef::new(vec![
                AnswerValidator::new(r"(?i)auto(?:matic)? mode(?: on)?", vec![]),
                AnswerValidator::new(r"(?i)scanning and tuning(?: started)?", vec![]),
            ]),
        )
        .devices(&[DeviceType::Catch]),
        entry(CommandDef::new(SetSerialMode, &["!SERIAL"]), lines.clone()),
        entry(CommandDef::new(SetAnalogMode, &["!ANALOG"]), lines.clone()),
        entry(CommandDef::new(SetKhz, &["!KHZ"]), lines.clone())
            .devices(&[DeviceType::Catch, DeviceType::Unknown]),
        entry(CommandDef::new(SetMhz, &["!MHZ"]), lines.clone())
            .devices(&[DeviceType::Catch, DeviceType::Unknown]),
        entry(
            CommandDef::new(SetFrequency, &["!f", "!freq", "!frequency"]).setter(frequency_setter()),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetGain, &["!g", "!gain"]).setter(gain_setter()),
            lines,
        ),
    ]
}

fn v1_entries() -> Vec<RegistryEntry> {
    use CommandCode::*;

    let lines = AnswerDef::new(v1_lines());
    let framed = VersionRange::from(FRAMED_VERSION);
    let entry = |def: CommandDef, answer: AnswerDef| RegistryEntry::new(def, answer).versions(framed);
    let procedure_devices = [DeviceType::Catch, DeviceType::Descale];

    let mut type_validators = v1_lines();
    type_validators.push(AnswerValidator::new(
        r"(?P<device_type>[A-Za-z]+)",
        vec![field(Field::DeviceType, Converter::DeviceType)],
    ));

    let mut update_fields = v1_status_fields();
    update_fields.push(field(Field::RelayMode, Converter::RelayMode));
    update_fields.push(field(Field::CommunicationMode, Converter::CommunicationMode));

    vec![
        entry(CommandDef::new(GetOverview, &["?"]), lines.clone()),
        entry(CommandDef::new(GetInfo, &["?info"]), lines.clone()),
        entry(CommandDef::new(GetType, &["?type"]), AnswerDef::new(type_validators)),
        entry(
            CommandDef::new(ListCommands, &["?list_commands"]),
            AnswerDef::single(AnswerValidator::new(
                r"(?s)(?P<commands>.+)",
                vec![field(Field::Commands, Converter::Text)],
            )),
        ),
        entry(
            CommandDef::new(GetUpdate, &["?update"]),
            AnswerDef::single(AnswerValidator::derived(update_fields, '#')),
        ),
        entry(
            CommandDef::new(GetStatus, &["-"]),
            AnswerDef::single(AnswerValidator::derived(v1_status_fields(), '#')),
        ),
        entry(
            CommandDef::new(GetSens, &["?sens"]),
            AnswerDef::single(AnswerValidator::derived(sens_fields(Converter::Float), '#')),
        )
        .devices(&[DeviceType::Catch]),
        entry(
            CommandDef::new(GetFrequency, &["?f", "?freq", "?frequency"]),
            lines.clone(),
        ),
        entry(CommandDef::new(GetGain, &["?g", "?gain"]), lines.clone()),
        entry(
            CommandDef::new(GetUipt, &["?uipt"]),
            AnswerDef::single(AnswerValidator::derived(
                vec![
                    field(Field::Urms, Converter::Float),
                    field(Field::Irms, Converter::Float),
                    field(Field::Phase, Converter::Float),
                ],
                '#',
            )),
        ),
        entry(
            CommandDef::new(GetPzt, &["?pzt"]),
            AnswerDef::single(AnswerValidator::derived(sens_fields(Converter::Float), '#')),
        )
        .build(BuildType::Debug),
        entry(CommandDef::new(GetAtf, &["?atf"]).indexed(1..=4), lines.clone()),
        entry(CommandDef::new(GetAtk, &["?atk"]).indexed(1..=4), lines.clone()),
        entry(CommandDef::new(GetAtt, &["?att"]).indexed(1..=4), lines.clone()),
        entry(CommandDef::new(GetAton, &["?aton"]).indexed(1..=4), lines.clone()),
        entry(CommandDef::new(SetOn, &["!ON"]), lines.clone()),
        entry(CommandDef::new(SetOff, &["!OFF"]), lines.clone()),
        entry(CommandDef::new(SetAuto, &["!AUTO"]), lines.clone()).devices(&[DeviceType::Catch]),
        entry(CommandDef::new(SetSerialMode, &["!SERIAL"]), lines.clone()),
        entry(CommandDef::new(SetAnalogMode, &["!ANALOG"]), lines.clone()),
        entry(CommandDef::new(SetKhz, &["!KHZ"]), lines.clone())
            .devices(&[DeviceType::Catch, DeviceType::Unknown]),
        entry(CommandDef::new(SetMhz, &["!MHZ"]), lines.clone())
            .devices(&[DeviceType::Catch, DeviceType::Unknown]),
        entry(
            CommandDef::new(SetFrequency, &["!f", "!freq", "!frequency"]).setter(frequency_setter()),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetGain, &["!g", "!gain"]).setter(gain_setter()),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetSwf, &["!swf"]).setter(SetterKind::Int { min: 0, max: 15 }),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetAtf, &["!atf"])
                .indexed(1..=4)
                .setter(frequency_setter()),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetAtk, &["!atk"])
                .indexed(1..=4)
                .setter(SetterKind::Float),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetAtt, &["!att"])
                .indexed(1..=4)
                .setter(SetterKind::Float),
            lines.clone(),
        ),
        entry(
            CommandDef::new(SetAton, &["!aton"])
                .indexed(1..=4)
                .setter(SetterKind::Int {
                    min: 0,
                    max: i64::from(u32::MAX),
                }),
            lines.clone(),
        ),
        entry(CommandDef::new(Scan, &["!scan"]), lines.clone()).devices(&procedure_devices),
        entry(CommandDef::new(Tune, &["!tune"]), lines.clone()).devices(&procedure_devices),
        entry(CommandDef::new(Auto, &["!auto"]), lines.clone()).devices(&procedure_devices),
        entry(CommandDef::new(Wipe, &["!wipe"]), lines.clone()).devices(&[DeviceType::Wipe]),
        entry(
            CommandDef::new(Ramp, &["!ramp"]).setter(SetterKind::Text),
            lines,
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetScanGain, &["!scan_gain"]).setter(gain_setter()),
            echo("scan_gain"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetScanFRange, &["!scan_f_range"]).setter(frequency_setter()),
            echo("scan_f_range"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetScanFStep, &["!scan_f_step"]).setter(frequency_setter()),
            echo("scan_f_step"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetScanTStep, &["!scan_t_step"]).setter(SetterKind::int()),
            echo("scan_t_step"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetTuneFStep, &["!tune_f_step"]).setter(frequency_setter()),
            echo("tune_f_step"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetTuneTTime, &["!tune_t_time"]).setter(SetterKind::int()),
            echo("tune_t_time"),
        )
        .devices(&procedure_devices),
        entry(
            CommandDef::new(SetTuneTStep, &["!tune_t_step"]).setter(SetterKind::int()),
            echo("tune_t_step"),
        )
        .devices(&procedure_devices),
    ]
}

/// Every registry entry, legacy first
pub(crate) fn entries() -> Vec<RegistryEntry> {
    let mut entries = legacy_entries();
    entries.extend(v1_entries());
    entries.push(RegistryEntry::new(
        CommandDef::new(CommandCode::GetProtocol, &["?protocol"]),
        protocol_answer(),
    ));
    entries
}
