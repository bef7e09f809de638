use chrono::{TimeZone, Utc};
use shared::{
    domain::NodeId,
    simulate::{SimNodeStatus, SimulateEvent, SimulationStatus},
};

use crate::reducers::simulate::{apply, SimulateState, MESSAGE_WINDOW};

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

fn started(nodes: &[&str]) -> SimulateEvent {
    SimulateEvent::Started {
        nodes: nodes.iter().map(|n| node(n)).collect(),
        speed: 1.0,
        timeout_seconds: None,
    }
}

fn message(from: &str) -> SimulateEvent {
    SimulateEvent::Message {
        from: node(from),
        to: "broker".into(),
        topic: Some("telemetry/temp".into()),
        payload: serde_json::json!({"temp": 21.5}),
        timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap(),
    }
}

#[test]
fn started_resets_the_previous_run() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["old"]));
    apply(&mut state, &message("old"));
    apply(&mut state, &SimulateEvent::TestResult {
        name: "stale".into(),
        passed: false,
    });

    apply(&mut state, &started(&["fresh"]));
    assert_eq!(state.status, SimulationStatus::Running);
    assert!(state.nodes.contains_key(&node("fresh")));
    assert!(!state.nodes.contains_key(&node("old")));
    assert_eq!(state.message_count, 0);
    assert!(state.test_summary.is_empty());
}

#[test]
fn message_window_keeps_only_the_most_recent() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    for _ in 0..(MESSAGE_WINDOW + 25) {
        apply(&mut state, &message("n"));
    }
    assert_eq!(state.messages.len(), MESSAGE_WINDOW);
    // The running totals are not bounded by the window.
    assert_eq!(state.message_count, (MESSAGE_WINDOW + 25) as u64);
    assert_eq!(
        state.nodes[&node("n")].message_count,
        (MESSAGE_WINDOW + 25) as u64
    );
}

#[test]
fn message_from_unseen_node_creates_it() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&[]));
    apply(&mut state, &message("surprise"));
    assert_eq!(state.nodes[&node("surprise")].message_count, 1);
}

#[test]
fn pause_freezes_elapsed_and_resume_continues() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::Tick { elapsed_ms: 4_000 });
    apply(&mut state, &SimulateEvent::Paused {
        elapsed_ms: Some(5_000),
    });

    assert_eq!(state.status, SimulationStatus::Paused);
    assert_eq!(state.elapsed_now(), 5_000);

    apply(&mut state, &SimulateEvent::Resumed { elapsed_ms: None });
    assert_eq!(state.status, SimulationStatus::Running);
    assert!(state.elapsed_now() >= 5_000);
}

#[test]
fn running_elapsed_extrapolates_past_the_last_tick() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::Tick { elapsed_ms: 1_000 });
    assert!(state.elapsed_now() >= 1_000);
}

#[test]
fn resume_without_a_pause_is_ignored() {
    let mut state = SimulateState::default();
    apply(&mut state, &SimulateEvent::Resumed { elapsed_ms: Some(9) });
    assert_eq!(state.status, SimulationStatus::Idle);
}

#[test]
fn nonpositive_speed_changes_are_rejected() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::SpeedChanged { speed: 0.0 });
    assert_eq!(state.speed, 1.0);
    apply(&mut state, &SimulateEvent::SpeedChanged { speed: 4.0 });
    assert_eq!(state.speed, 4.0);
}

#[test]
fn stop_marks_every_node_offline() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["a", "b"]));
    apply(&mut state, &SimulateEvent::NodeStatus {
        node_id: node("a"),
        status: SimNodeStatus::Online,
        readings: None,
    });
    apply(&mut state, &SimulateEvent::Stopped {
        elapsed_ms: Some(2_000),
    });

    assert_eq!(state.status, SimulationStatus::Stopped);
    assert_eq!(state.elapsed_now(), 2_000);
    assert!(state
        .nodes
        .values()
        .all(|n| n.status == SimNodeStatus::Offline));
}

#[test]
fn completion_after_a_stop_is_ignored() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::Stopped { elapsed_ms: Some(1) });
    apply(&mut state, &SimulateEvent::Complete {
        elapsed_ms: Some(99),
        messages_sent: 10,
        tests_passed: 1,
        tests_failed: 0,
    });
    assert_eq!(state.status, SimulationStatus::Stopped);
    assert_eq!(state.elapsed_now(), 1);
}

#[test]
fn node_readings_are_replaced_wholesale() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::NodeStatus {
        node_id: node("n"),
        status: SimNodeStatus::Online,
        readings: Some([("temp".to_string(), serde_json::json!(20))].into()),
    });
    apply(&mut state, &SimulateEvent::NodeStatus {
        node_id: node("n"),
        status: SimNodeStatus::Online,
        readings: Some([("humidity".to_string(), serde_json::json!(40))].into()),
    });
    // A status event without readings leaves the last replacement alone.
    apply(&mut state, &SimulateEvent::NodeStatus {
        node_id: node("n"),
        status: SimNodeStatus::Error,
        readings: None,
    });

    let readings = &state.nodes[&node("n")].latest_readings;
    assert!(!readings.contains_key("temp"));
    assert_eq!(readings["humidity"], serde_json::json!(40));
    assert_eq!(state.nodes[&node("n")].status, SimNodeStatus::Error);
}

#[test]
fn test_results_are_keyed_by_name() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::TestResult {
        name: "boots".into(),
        passed: false,
    });
    apply(&mut state, &SimulateEvent::TestResult {
        name: "boots".into(),
        passed: true,
    });
    assert_eq!(state.tests_passed(), 1);
    assert_eq!(state.tests_failed(), 0);
}

#[test]
fn backend_error_stops_the_run_with_a_message() {
    let mut state = SimulateState::default();
    apply(&mut state, &started(&["n"]));
    apply(&mut state, &SimulateEvent::Error {
        message: "qemu crashed".into(),
    });
    assert_eq!(state.status, SimulationStatus::Stopped);
    assert_eq!(state.error.as_deref(), Some("qemu crashed"));
}
