//! Golden answers for every command of every table the registry builds

use pretty_assertions::assert_eq;

use sonicamp_core::protocol::{
    CommandCode, DeviceType, Field, ProtocolRegistry, RelayMode, Value, Version, FRAMED_VERSION,
    LEGACY_VERSIONS,
};

/// A typical answer of legacy firmware
fn legacy_answer(code: CommandCode) -> Option<&'static str> {
    use CommandCode::*;
    let answer = match code {
        GetOverview => {
            "ver 0.4.0\nsoniccatch\nsignal off\nkhz mode\nfrequency: 1000000\ngain: 50\ntemperature: 23.5"
        }
        GetInfo => "ver 0.5.0\nsoniccatch\nfirmware info: build 42",
        GetType => "catch",
        GetProtocol => "catch#0.4.0#1",
        GetStatus => "1000000-50-23.5",
        GetSens => "1000000 500 300 20",
        SetOn => "signal on",
        SetOff => "signal off",
        SetAuto => "Scanning and tuning started",
        SetSerialMode => "serial mode",
        SetAnalogMode => "analog mode",
        SetKhz => "khz mode",
        SetMhz => "mhz mode",
        SetFrequency => "frequency: 1000 Hz",
        SetGain => "gain: 50%",
        _ => return None,
    };
    Some(answer)
}

/// A typical answer of framed firmware
fn v1_answer(code: CommandCode) -> Option<&'static str> {
    use CommandCode::*;
    let answer = match code {
        GetOverview => "freq=1000 Hz\ngain=50 %\nsignal=on\nrelay=mhz\ncomm=serial\ntemp=23.5 C",
        GetInfo => "type=descale\nfirmware=1.0.2\nprotocol=1.0.0\nrelease=false\ninfo=lab build",
        GetType => "wipe",
        GetProtocol => "descale#1.0.0#0",
        ListCommands => "?,?info,?type,!f,!g",
        GetUpdate => "1000#50#1#0#23.5#10.0#2.0#3.0#mhz#serial",
        GetStatus => "1000#50#1#2#23.5#10.0#2.0#-3.5",
        GetSens | GetPzt => "1000#10.0#2.0#3.0",
        GetFrequency => "freq=1000 Hz",
        GetGain => "gain=50 %",
        GetUipt => "10.0#2.0#3.0",
        GetAtf => "atf1=100000",
        GetAtk => "atk2=1.5",
        GetAtt => "att3=20.0",
        GetAton => "aton4=100",
        SetOn => "signal=on",
        SetOff => "signal=off",
        SetAuto | Auto => "procedure=3",
        SetSerialMode => "comm=serial",
        SetAnalogMode => "comm=analog",
        SetKhz => "relay=khz",
        SetMhz => "relay=mhz",
        SetFrequency => "freq=1000",
        SetGain => "gain=50",
        SetSwf => "swf=3",
        SetAtf => "atf1=1000",
        SetAtk => "atk1=1.5",
        SetAtt => "att1=20.0",
        SetAton => "aton1=100",
        Scan => "procedure=1",
        Tune => "procedure=2",
        Wipe => "procedure=4",
        Ramp => "procedure=5",
        SetScanGain => "scan_gain=10",
        SetScanFRange => "scan_f_range=100000",
        SetScanFStep => "scan_f_step=1000",
        SetScanTStep => "scan_t_step=10",
        SetTuneFStep => "tune_f_step=1000",
        SetTuneTTime => "tune_t_time=1000",
        SetTuneTStep => "tune_t_step=10",
        _ => return None,
    };
    Some(answer)
}

#[test]
fn test_every_table_accepts_golden_answers() {
    let registry = ProtocolRegistry::new();
    let versions = LEGACY_VERSIONS.iter().chain([FRAMED_VERSION].iter());

    for version in versions {
        for device_type in DeviceType::ALL {
            for is_release in [true, false] {
                let table = registry.build(device_type, *version, is_release);
                assert!(!table.is_empty(), "{device_type} {version} has no commands");

                for (code, lookup) in table.lookups() {
                    let golden = if *version < FRAMED_VERSION {
                        legacy_answer(*code)
                    } else {
                        v1_answer(*code)
                    };
                    let golden = golden.unwrap_or_else(|| {
                        panic!("no golden answer for {code} ({device_type} {version})")
                    });
                    let validation = lookup.answer_def.validate(golden);
                    assert!(
                        validation.valid,
                        "{code} of {device_type} {version} rejected {golden:?}: {:?}",
                        validation.unknown_answers
                    );
                }
            }
        }
    }
}

#[test]
fn test_sens_scaling_depends_on_version() {
    let registry = ProtocolRegistry::new();
    let sens = |version: Version| {
        let table = registry.build(DeviceType::Catch, version, true);
        table
            .get(CommandCode::GetSens)
            .expect("catch reports sens")
            .answer_def
            .validate("1000000 1.5 0.25 20")
    };

    // 0.4 reports integers only
    assert!(!sens(Version::new(0, 4, 0)).valid);

    let scaled = sens(Version::new(0, 5, 0));
    assert!(scaled.valid);
    assert_eq!(scaled.value_dict.get(&Field::Urms), Some(&Value::Float(1500.0)));
    assert_eq!(scaled.value_dict.get(&Field::Irms), Some(&Value::Float(250.0)));
}

#[test]
fn test_devices_only_get_their_commands() {
    let registry = ProtocolRegistry::new();
    let wipe = registry.build(DeviceType::Wipe, FRAMED_VERSION, true);
    assert!(wipe.has(CommandCode::Wipe));
    assert!(!wipe.has(CommandCode::Scan));
    assert!(!wipe.has(CommandCode::SetKhz));
    assert!(!wipe.has(CommandCode::GetPzt));

    let debug_catch = registry.build(DeviceType::Catch, FRAMED_VERSION, false);
    assert!(debug_catch.has(CommandCode::GetPzt));
    assert!(debug_catch.can_report_procedure());

    let legacy = registry.build(DeviceType::Catch, Version::new(0, 3, 0), true);
    assert!(!legacy.has(CommandCode::GetSens));
    assert!(!legacy.can_report_procedure());
}

#[test]
fn test_legacy_overview_fields() {
    let table = ProtocolRegistry::new().build(DeviceType::Catch, LEGACY_VERSIONS[1], true);
    let validation = table
        .get(CommandCode::GetOverview)
        .unwrap()
        .answer_def
        .validate(legacy_answer(CommandCode::GetOverview).unwrap());

    let values = validation.value_dict;
    assert_eq!(values.get(&Field::Frequency), Some(&Value::Int(1_000_000)));
    assert_eq!(values.get(&Field::Gain), Some(&Value::Int(50)));
    assert_eq!(values.get(&Field::RelayMode), Some(&Value::RelayMode(RelayMode::Khz)));
    assert_eq!(values.get(&Field::Signal), Some(&Value::Bool(false)));
}

#[test]
fn test_indexed_answers_land_in_their_channel() {
    let table = ProtocolRegistry::new().build(DeviceType::Catch, FRAMED_VERSION, true);
    let validation = table
        .get(CommandCode::GetAtk)
        .unwrap()
        .answer_def
        .validate("atk2=1.5");
    assert_eq!(
        validation.value_dict.get(&Field::Atk(2)),
        Some(&Value::Float(1.5))
    );
}
