//! Procedures: host-driven ramps, firmware procedures and the controller

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sonicamp_core::device::DeviceError;
use sonicamp_core::events::Event;
use sonicamp_core::procedures::{
    HoldDuration, Procedure, ProcedureArgs, ProcedureController, ProcedureType, RampArgs,
    RamperLocal, RamperRemote, ScanArgs, TuneArgs,
};

use common::{commands, connect, legacy_catch, MockDevice};

fn ramp(start: i64, stop: i64, step: i64, hold_on_ms: f64, hold_off_ms: f64) -> ProcedureArgs {
    ProcedureArgs::Ramp(RampArgs {
        start,
        stop,
        step,
        hold_on: HoldDuration::ms(hold_on_ms),
        hold_off: HoldDuration::ms(hold_off_ms),
    })
}

async fn wait_for_commands(mock: &MockDevice, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while commands(&mock.requests()).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("device never received {count} commands"));
}

async fn wait_for_request(mock: &MockDevice, request: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !mock.requests().iter().any(|r| r == request) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("device never received {request}"));
}

fn procedure_events(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if matches!(
            event,
            Event::ProcedureRunning { .. } | Event::ProcedureStopped
        ) {
            seen.push(event);
        }
    }
    seen
}

#[tokio::test]
async fn test_local_ramp_writes() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    RamperLocal
        .execute(
            &device,
            &ramp(1_000_000, 1_000_200, 100, 10.0, 0.0),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let requests = mock.requests();
    assert_eq!(requests[0], "?");
    // Pre-step sets the first value before `!ON`; the loop then sets it again
    assert_eq!(
        commands(&requests),
        vec![
            "!f=1000000",
            "!ON",
            "!f=1000000",
            "!f=1000100",
            "!f=1000200",
            "!OFF"
        ]
    );
    assert_eq!(device.status().snapshot().signal(), Some(false));
}

#[tokio::test]
async fn test_pulsed_local_ramp() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    RamperLocal
        .execute(
            &device,
            &ramp(2000, 1800, 100, 5.0, 5.0),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        commands(&mock.requests()),
        vec![
            "!f=2000", "!ON", "!f=2000", "!ON", "!OFF", "!f=1900", "!ON", "!OFF", "!f=1800", "!ON",
            "!OFF", "!OFF"
        ]
    );
}

#[tokio::test]
async fn test_zero_step_is_rejected() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    let result = RamperLocal
        .execute(&device, &ramp(0, 100, 0, 1.0, 0.0), &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_ramps_at_the_integer_bounds_send_nothing() {
    let mock = legacy_catch();
    let device = connect(&mock).await;

    for args in [
        ramp(i64::MAX - 1, i64::MAX, 1, 1.0, 0.0),
        ramp(i64::MIN + 1, i64::MIN, 1, 1.0, 0.0),
        ramp(0, 10, i64::MIN, 1.0, 0.0),
        ramp(1_000_000, 20_000_000, 1, 1.0, 0.0),
    ] {
        let result = RamperLocal
            .execute(&device, &args, &CancellationToken::new())
            .await;
        assert!(
            matches!(result, Err(DeviceError::InvalidArgument(_))),
            "{args:?} gave {result:?}"
        );
    }
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_firmware_ramp_out_of_range_sends_nothing() {
    let mock = MockDevice::demo(6);
    let device = connect(&mock).await;
    mock.clear();

    let result = RamperRemote
        .execute(
            &device,
            &ramp(i64::MAX - 1, i64::MAX, 1, 1.0, 0.0),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(DeviceError::InvalidArgument(_))));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_stopping_a_ramp_switches_the_signal_off() {
    let mock = legacy_catch();
    let device = connect(&mock).await;
    let mut events = device.events().subscribe();
    let controller = ProcedureController::new(device.clone());

    controller
        .execute(ramp(1_000_000, 2_000_000, 100, 10_000.0, 0.0))
        .unwrap();
    assert_eq!(controller.running_procedure(), Some(ProcedureType::Ramp));
    // first value, signal on, first step
    wait_for_commands(&mock, 3).await;

    controller.stop().await;

    assert!(!controller.is_running());
    let requests = commands(&mock.requests());
    assert_eq!(requests, vec!["!f=1000000", "!ON", "!f=1000000", "!OFF"]);
    assert_eq!(
        procedure_events(&mut events),
        vec![
            Event::ProcedureRunning {
                procedure: "ramp".to_string()
            },
            Event::ProcedureStopped,
        ]
    );
}

#[tokio::test]
async fn test_one_procedure_at_a_time() {
    let mock = legacy_catch();
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device);

    controller
        .execute(ramp(1000, 5000, 100, 10_000.0, 0.0))
        .unwrap();
    assert!(matches!(
        controller.execute(ramp(1000, 2000, 100, 1.0, 0.0)),
        Err(DeviceError::ProcedureAlreadyRunning)
    ));
    controller.stop().await;

    // Free again once stopped
    controller.execute(ramp(1000, 1000, 100, 1.0, 0.0)).unwrap();
    controller.wait().await.unwrap();
}

#[tokio::test]
async fn test_legacy_devices_have_no_firmware_procedures() {
    let mock = legacy_catch();
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device);

    assert_eq!(controller.supported(), vec![ProcedureType::Ramp]);
    assert!(matches!(
        controller.execute(ProcedureArgs::Scan(ScanArgs::default())),
        Err(DeviceError::ProcedureUnsupported(_))
    ));
}

#[tokio::test]
async fn test_firmware_scan_runs_to_completion() {
    let mock = MockDevice::demo(21);
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device.clone());
    assert_eq!(
        controller.supported(),
        vec![
            ProcedureType::Ramp,
            ProcedureType::Scan,
            ProcedureType::Tune,
            ProcedureType::Auto,
        ]
    );
    mock.clear();

    controller
        .execute(ProcedureArgs::Scan(ScanArgs {
            gain: 20,
            f_range: 50_000,
            f_step: 500,
            t_step: HoldDuration::ms(1.0),
        }))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller.wait())
        .await
        .expect("scan finishes")
        .unwrap();

    assert_eq!(
        commands(&mock.requests()),
        vec![
            "!scan_gain=20",
            "!scan_f_range=50000",
            "!scan_f_step=500",
            "!scan_t_step=1",
            "!scan",
        ]
    );
    assert_eq!(device.status().snapshot().procedure(), Some(0));
}

#[tokio::test]
async fn test_firmware_ramp() {
    let mock = MockDevice::demo(4);
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device.clone());
    mock.clear();

    controller.execute(ramp(1000, 1200, 100, 10.0, 0.0)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), controller.wait())
        .await
        .expect("ramp finishes")
        .unwrap();

    assert_eq!(commands(&mock.requests()), vec!["!ramp=1000,1200,100,10,0"]);
}

#[tokio::test]
async fn test_cancelled_tune_releases_signal() {
    let mock = MockDevice::demo(8);
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device.clone());

    controller
        .execute(ProcedureArgs::Tune(TuneArgs {
            t_time: HoldDuration::s(60.0),
            ..TuneArgs::default()
        }))
        .unwrap();
    wait_for_request(&mock, "!tune").await;
    controller.stop().await;

    assert_eq!(commands(&mock.requests()).last().map(String::as_str), Some("!OFF"));
    assert_eq!(device.status().snapshot().signal(), Some(false));
}

#[tokio::test]
async fn test_disconnect_cancels_running_procedure() {
    let mock = MockDevice::demo(13);
    let device = connect(&mock).await;
    let controller = ProcedureController::new(device.clone());

    controller
        .execute(ProcedureArgs::Tune(TuneArgs {
            t_time: HoldDuration::s(60.0),
            ..TuneArgs::default()
        }))
        .unwrap();
    wait_for_request(&mock, "!tune").await;
    device.disconnect().await;

    let result = tokio::time::timeout(Duration::from_secs(2), controller.wait())
        .await
        .expect("procedure ends with the device");
    assert!(result.is_err());
}
