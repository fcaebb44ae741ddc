//! Device session: typed commands, status tracking and the auto-updater

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use sonicamp_core::device::{DeviceBuilder, DeviceError, UpdateStrategy};
use sonicamp_core::events::Event;
use sonicamp_core::protocol::{
    CommandCallLog, CommandCallRecord, CommandCode, Communicator, DeviceLogSink, Field,
    FrameProtocol, LogLevel, Value,
};

use common::{connect, fast_config, fast_device_config, legacy_catch, open, MockDevice};

fn minimal_framed() -> MockDevice {
    MockDevice::new(FrameProtocol::Framed, |request| {
        let answer = match request {
            "?protocol" => "catch#1.0.0#1",
            "?info" => "firmware=1.0.0",
            "?update" => "1000000#10#0#0#23.0#0.0#0.0#0.0#khz#serial",
            "?g" => "gain=42",
            _ => "unknown command",
        };
        Some(answer.to_string())
    })
}

#[tokio::test]
async fn test_gain_query_updates_status() {
    let mock = minimal_framed();
    let device = connect(&mock).await;
    assert_eq!(device.status().snapshot().gain(), Some(10));
    mock.clear();

    let answer = device.execute_command(CommandCode::GetGain).await.unwrap();

    assert!(answer.valid);
    assert_eq!(answer.get(Field::Gain), Some(&Value::Int(42)));
    assert_eq!(device.status().snapshot().gain(), Some(42));
    assert_eq!(mock.requests(), vec!["?g"]);
}

#[tokio::test]
async fn test_device_logs_are_split_from_the_answer() {
    let mock = MockDevice::new(FrameProtocol::Framed, |request| {
        let answer = match request {
            "?protocol" => "catch#1.0.0#1",
            "?info" => "firmware=1.0.0",
            "?update" => "1000000#10#0#0#23.0#0.0#0.0#0.0#khz#serial",
            "?f" | "?freq" => "LOG=INFO: hi\nfreq=1234 Hz",
            _ => "unknown command",
        };
        Some(answer.to_string())
    });
    let logs = Arc::new(Mutex::new(Vec::new()));
    let sink_logs = logs.clone();
    let sink: DeviceLogSink = Arc::new(move |level: LogLevel, message: &str| {
        sink_logs.lock().unwrap().push((level, message.to_string()));
    });

    let config = fast_config(FrameProtocol::Framed);
    let baud_rate = config.baud_rate;
    let communicator = Arc::new(Communicator::new(config).with_log_sink(sink));
    communicator
        .open_communication(mock.factory(), baud_rate)
        .await
        .unwrap();
    let device = DeviceBuilder::new()
        .with_config(fast_device_config())
        .build(communicator)
        .await
        .unwrap();

    let answer = device.execute_raw("?freq").await.unwrap();
    assert!(answer.valid);
    assert_eq!(answer.get(Field::Frequency), Some(&Value::Int(1234)));
    assert_eq!(*logs.lock().unwrap(), vec![(LogLevel::Info, "hi".to_string())]);

    let answer = device.execute_command(CommandCode::GetFrequency).await.unwrap();
    assert_eq!(answer.get(Field::Frequency), Some(&Value::Int(1234)));
    assert_eq!(device.status().snapshot().frequency(), Some(1234));
    assert_eq!(logs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_status_changes_are_published() {
    let mock = minimal_framed();
    let device = connect(&mock).await;
    let mut events = device.events().subscribe();
    let mut changed = device.status().subscribe_changed();

    device.execute_command(CommandCode::GetGain).await.unwrap();

    assert!(changed.has_changed().unwrap());
    assert_eq!(
        events.recv().await.unwrap(),
        Event::StatusChanged {
            changed: vec![Field::Gain]
        }
    );

    // Same value again: nothing changes
    changed.borrow_and_update();
    device.execute_command(CommandCode::GetGain).await.unwrap();
    assert!(!changed.has_changed().unwrap());
}

#[tokio::test]
async fn test_commands_outside_the_table_are_refused() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    let result = device.execute_command(CommandCode::Scan).await;
    assert!(matches!(
        result,
        Err(DeviceError::UnsupportedCommand(CommandCode::Scan))
    ));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_setter_range_is_checked_before_sending() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    assert!(matches!(
        device.set_gain(500).await,
        Err(DeviceError::InvalidArgument(_))
    ));
    assert!(mock.requests().is_empty());

    let answer = device.set_gain(80).await.unwrap();
    assert!(answer.valid);
    assert_eq!(device.status().snapshot().gain(), Some(80));
    assert_eq!(mock.requests(), vec!["!g=80"]);
}

#[tokio::test]
async fn test_signal_overrides_apply_on_valid_answers() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    device.set_signal_on().await.unwrap();
    assert_eq!(device.status().snapshot().signal(), Some(true));
    device.set_signal_off().await.unwrap();
    assert_eq!(device.status().snapshot().signal(), Some(false));
}

#[tokio::test]
async fn test_raw_requests() {
    let mock = MockDevice::demo(3);
    let device = connect(&mock).await;

    let answer = device.execute_raw("!f=250000").await.unwrap();
    assert!(answer.valid);
    assert_eq!(device.status().snapshot().frequency(), Some(250_000));
    assert!(device.has_command_alias("!f=250000"));

    let answer = device.execute_raw("hello").await.unwrap();
    assert!(!answer.valid);
    assert_eq!(answer.message, "unknown command: hello");
    assert!(!device.has_command_alias("hello"));
}

#[tokio::test]
async fn test_auto_update_follows_signal_and_relay() {
    let mock = MockDevice::demo(11);
    let device = connect(&mock).await;
    assert_eq!(device.active_update_strategy().await, None);

    device.start_auto_update().await;
    assert_eq!(
        device.active_update_strategy().await,
        Some(UpdateStrategy::Status)
    );

    // MHz relay is the demo default, so switching on selects ?sens
    device.set_signal_on().await.unwrap();
    assert_eq!(
        device.active_update_strategy().await,
        Some(UpdateStrategy::Sens)
    );

    device.set_relay_mode_khz().await.unwrap();
    assert_eq!(
        device.active_update_strategy().await,
        Some(UpdateStrategy::Status)
    );

    let mut changed = device.status().subscribe_changed();
    changed.borrow_and_update();
    tokio::time::timeout(Duration::from_secs(2), changed.changed())
        .await
        .expect("poller refreshes the status")
        .unwrap();
    assert!(mock.requests().iter().any(|r| r == "-"));

    device.stop_auto_update().await;
    assert_eq!(device.active_update_strategy().await, None);
}

#[tokio::test]
async fn test_disconnect_tears_down_session() {
    let mock = MockDevice::demo(5);
    let device = connect(&mock).await;
    let mut events = device.events().subscribe();
    device.start_auto_update().await;

    device.disconnect().await;

    assert!(device.cancellation_token().is_cancelled());
    assert!(!device.is_connected());
    assert_eq!(device.active_update_strategy().await, None);
    let disconnected = async {
        while let Ok(event) = events.recv().await {
            if event == Event::Disconnected {
                return true;
            }
        }
        false
    };
    assert!(tokio::time::timeout(Duration::from_secs(1), disconnected)
        .await
        .unwrap());
    assert!(device
        .get_overview()
        .await
        .is_err_and(|e| e.is_connection_error()));
}

#[tokio::test]
async fn test_call_log_sees_every_request() {
    let mock = MockDevice::demo(9);
    let records = Arc::new(Mutex::new(Vec::new()));
    let sink = records.clone();
    let call_log: CommandCallLog = Arc::new(move |record: &CommandCallRecord| {
        sink.lock().unwrap().push(record.clone());
    });

    let communicator = open(&mock, fast_config(FrameProtocol::Framed)).await;
    let device = DeviceBuilder::new()
        .with_config(fast_device_config())
        .with_call_log(call_log)
        .build(communicator)
        .await
        .unwrap();
    device.set_frequency(500_000).await.unwrap();

    let records = records.lock().unwrap();
    let requests: Vec<&str> = records.iter().map(|r| r.request.as_str()).collect();
    assert_eq!(requests, vec!["?protocol", "?info", "?update", "!f=500000"]);
    assert!(records.iter().all(|r| r.valid));
    assert!(records[3].to_json().contains("\"request\":\"!f=500000\""));
}
