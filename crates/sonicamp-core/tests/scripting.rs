//! Scripts run end to end against a scripted legacy device

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use sonicamp_core::events::Event;
use sonicamp_core::scripting::{parse_script, EngineState, ScriptEngine, ScriptError};

use common::{commands, connect, legacy_catch, MockDevice};

async fn engine() -> (MockDevice, ScriptEngine) {
    let mock = legacy_catch();
    let device = connect(&mock).await;
    (mock, ScriptEngine::new(device))
}

async fn run_to_end(engine: &ScriptEngine, source: &str) {
    engine.load_source(source).await.unwrap();
    engine.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.wait())
        .await
        .expect("script finishes");
}

fn state_changes(events: &mut broadcast::Receiver<Event>) -> Vec<String> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::PropertyChange { name, new, .. } = event {
            if name == "state" {
                states.push(new);
            }
        }
    }
    states
}

#[tokio::test]
async fn test_nested_loops() {
    let (mock, engine) = engine().await;
    run_to_end(
        &engine,
        "startloop 2\n\
         startloop 2\n\
         frequency 1000\n\
         endloop\n\
         endloop\n",
    )
    .await;

    assert_eq!(
        commands(&mock.requests()),
        vec!["!f=1000", "!f=1000", "!f=1000", "!f=1000", "!OFF"]
    );
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.last_error(), None);
}

#[tokio::test]
async fn test_inner_loop_restarts_on_each_outer_pass() {
    let (mock, engine) = engine().await;
    run_to_end(
        &engine,
        "startloop 3\n\
         gain 10\n\
         startloop 2\n\
         frequency 2000\n\
         endloop\n\
         endloop\n",
    )
    .await;

    let requests = commands(&mock.requests());
    assert_eq!(requests.iter().filter(|r| *r == "!g=10").count(), 3);
    assert_eq!(requests.iter().filter(|r| *r == "!f=2000").count(), 6);
}

#[tokio::test]
async fn test_signal_hold_and_ramp() {
    let (mock, engine) = engine().await;
    run_to_end(
        &engine,
        "# warm up the transducer\n\
         frequency 1000000\n\
         on\n\
         hold 10ms\n\
         off\n\
         ramp_freq 1000, 1200, 100, 5ms\n",
    )
    .await;

    assert_eq!(
        commands(&mock.requests()),
        vec![
            "!f=1000000",
            "!ON",
            "!OFF",
            "!f=1000",
            "!ON",
            "!f=1000",
            "!f=1100",
            "!f=1200",
            "!OFF",
            "!OFF",
        ]
    );
}

#[tokio::test]
async fn test_state_changes_are_published() {
    let (_mock, engine) = engine().await;
    engine.load_source("frequency 1000\n").await.unwrap();
    let mut events = engine_events(&engine);

    engine.start().await.unwrap();
    engine.wait().await;

    assert_eq!(state_changes(&mut events), vec!["RUNNING", "READY"]);
}

fn engine_events(engine: &ScriptEngine) -> broadcast::Receiver<Event> {
    engine.device().events().subscribe()
}

#[tokio::test]
async fn test_failing_statement_pauses_the_script() {
    let (mock, engine) = engine().await;
    let mut events = engine_events(&engine);
    run_to_end(&engine, "frequency 1000\ngain 500\nfrequency 2000\n").await;

    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(engine.current_line(), Some(2));
    assert!(engine.last_error().is_some_and(|e| e.contains("line 2")));
    assert_eq!(commands(&mock.requests()), vec!["!f=1000"]);

    let mut errors = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::InterpretationError { .. }) {
            errors += 1;
        }
    }
    assert_eq!(errors, 1);

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.current_line(), Some(1));
    assert_eq!(commands(&mock.requests()).last().map(String::as_str), Some("!OFF"));
}

#[tokio::test]
async fn test_ramp_beyond_the_integer_range_pauses_the_script() {
    let (mock, engine) = engine().await;
    run_to_end(
        &engine,
        "ramp_freq 9223372036854775806, 9223372036854775807, 1, 1ms\n\
         frequency 1000\n",
    )
    .await;

    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(engine.current_line(), Some(1));
    assert!(engine.last_error().is_some_and(|e| e.contains("line 1")));
    assert!(commands(&mock.requests()).is_empty());
    engine.stop().await;
}

#[tokio::test]
async fn test_pause_and_resume() {
    let (mock, engine) = engine().await;
    engine
        .load_source("frequency 1000\nhold 10s\nfrequency 2000\n")
        .await
        .unwrap();
    engine.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while engine.current_line() != Some(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    engine.pause().await;

    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(engine.current_line(), Some(2));
    assert_eq!(commands(&mock.requests()), vec!["!f=1000"]);

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Ready);
}

#[tokio::test]
async fn test_single_step() {
    let (mock, engine) = engine().await;
    engine
        .load_source("frequency 1000\nfrequency 2000\n")
        .await
        .unwrap();

    engine.single_step().await.unwrap();
    engine.wait().await;
    assert_eq!(engine.state(), EngineState::Paused);
    assert_eq!(engine.current_line(), Some(2));
    assert_eq!(commands(&mock.requests()), vec!["!f=1000"]);

    engine.single_step().await.unwrap();
    engine.wait().await;
    assert_eq!(commands(&mock.requests()), vec!["!f=1000", "!f=2000"]);

    engine.start().await.unwrap();
    engine.wait().await;
    assert_eq!(engine.state(), EngineState::Ready);
    assert_eq!(engine.current_line(), Some(1));
}

#[tokio::test]
async fn test_engine_guards() {
    let (_mock, engine) = engine().await;
    assert!(matches!(engine.start().await, Err(ScriptError::NoScript)));

    assert!(matches!(
        engine.load_source("frequency\n").await,
        Err(ScriptError::Syntax { line: 1, .. })
    ));
    assert_eq!(engine.state(), EngineState::Ready);

    engine.load_source("hold 10s\n").await.unwrap();
    engine.start().await.unwrap();
    assert!(matches!(engine.start().await, Err(ScriptError::Busy)));
    assert!(matches!(
        engine.load_source("on\n").await,
        Err(ScriptError::Busy)
    ));
    engine.stop().await;
}

#[test]
fn test_syntax_errors_name_their_line() {
    let cases = [
        ("frequency 1000\nfrobnicate\n", 2),
        ("startloop 2\nfrequency 10\n", 1),
        ("frequency 10\n\nendloop\n", 3),
        ("ramp_freq 1000, 2000, 0, 10ms\n", 1),
        ("hold 10 minutes\n", 1),
    ];
    for (source, expected) in cases {
        match parse_script(source) {
            Err(ScriptError::Syntax { line, .. }) => assert_eq!(line, expected, "{source:?}"),
            other => panic!("{source:?} parsed to {other:?}"),
        }
    }
}
