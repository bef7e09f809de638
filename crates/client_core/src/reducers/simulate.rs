use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use shared::{
    domain::NodeId,
    simulate::{
        SimNodeStatus, SimulateEvent, SimulateStatusResponse, SimulationMessage, SimulationNode,
        SimulationStatus,
    },
};
use tracing::debug;

/// Only the most recent messages are retained; older ones are available
/// from the backend's paged message endpoint.
pub const MESSAGE_WINDOW: usize = 100;

/// Reconstructed simulate-stage state for one session.
#[derive(Debug, Clone)]
pub struct SimulateState {
    pub status: SimulationStatus,
    pub speed: f64,
    pub nodes: HashMap<NodeId, SimulationNode>,
    pub messages: VecDeque<SimulationMessage>,
    pub message_count: u64,
    pub test_summary: BTreeMap<String, bool>,
    pub error: Option<String>,
    /// Last authoritative elapsed figure from the backend.
    elapsed_ms: u64,
    /// Wall-clock instant at which `elapsed_ms` was last anchored.
    /// Set while running, cleared on pause/stop/complete.
    anchor: Option<Instant>,
}

impl Default for SimulateState {
    fn default() -> Self {
        Self {
            status: SimulationStatus::Idle,
            speed: 1.0,
            nodes: HashMap::new(),
            messages: VecDeque::new(),
            message_count: 0,
            test_summary: BTreeMap::new(),
            error: None,
            elapsed_ms: 0,
            anchor: None,
        }
    }
}

impl SimulateState {
    /// Simulated elapsed time, extrapolated between ticks. While running
    /// this advances at `speed` times wall-clock from the last anchor;
    /// otherwise it is exactly the last authoritative figure.
    pub fn elapsed_now(&self) -> u64 {
        match self.anchor {
            Some(anchor) if self.status == SimulationStatus::Running => {
                let wall = anchor.elapsed().as_millis() as f64;
                self.elapsed_ms + (wall * self.speed) as u64
            }
            _ => self.elapsed_ms,
        }
    }

    pub fn online_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == SimNodeStatus::Online)
            .count()
    }

    pub fn tests_passed(&self) -> usize {
        self.test_summary.values().filter(|p| **p).count()
    }

    pub fn tests_failed(&self) -> usize {
        self.test_summary.values().filter(|p| !**p).count()
    }

    pub fn from_snapshot(snapshot: SimulateStatusResponse) -> Self {
        let anchor = if snapshot.status == SimulationStatus::Running {
            Some(Instant::now())
        } else {
            None
        };
        Self {
            status: snapshot.status,
            speed: if snapshot.speed > 0.0 { snapshot.speed } else { 1.0 },
            nodes: snapshot.nodes,
            messages: VecDeque::new(),
            message_count: snapshot.message_count,
            test_summary: snapshot.test_summary,
            error: snapshot.error_message,
            elapsed_ms: snapshot.elapsed_time_ms,
            anchor,
        }
    }

    fn anchor_elapsed(&mut self, elapsed_ms: Option<u64>) {
        if let Some(ms) = elapsed_ms {
            self.elapsed_ms = ms;
        } else {
            self.elapsed_ms = self.elapsed_now();
        }
        self.anchor = Some(Instant::now());
    }

    fn freeze_elapsed(&mut self, elapsed_ms: Option<u64>) {
        if let Some(ms) = elapsed_ms {
            self.elapsed_ms = ms;
        } else {
            self.elapsed_ms = self.elapsed_now();
        }
        self.anchor = None;
    }
}

fn node_entry<'a>(state: &'a mut SimulateState, node_id: &NodeId) -> &'a mut SimulationNode {
    state
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| SimulationNode::new(node_id.clone()))
}

pub fn apply(state: &mut SimulateState, event: &SimulateEvent) {
    match event {
        SimulateEvent::Started { nodes, speed, .. } => {
            // A fresh start resets everything from the previous run.
            *state = SimulateState::default();
            state.status = SimulationStatus::Running;
            state.speed = if *speed > 0.0 { *speed } else { 1.0 };
            for node_id in nodes {
                state
                    .nodes
                    .insert(node_id.clone(), SimulationNode::new(node_id.clone()));
            }
            state.anchor = Some(Instant::now());
        }
        SimulateEvent::NodeStatus {
            node_id,
            status,
            readings,
        } => {
            let node = node_entry(state, node_id);
            node.status = *status;
            // Readings are replaced wholesale, not merged.
            if let Some(readings) = readings {
                node.latest_readings = readings.clone();
            }
        }
        SimulateEvent::Tick { elapsed_ms } => {
            if state.status == SimulationStatus::Running {
                state.anchor_elapsed(Some(*elapsed_ms));
            }
        }
        SimulateEvent::Message {
            from,
            to,
            topic,
            payload,
            timestamp,
        } => {
            node_entry(state, from).message_count += 1;
            state.message_count += 1;
            if state.messages.len() == MESSAGE_WINDOW {
                state.messages.pop_front();
            }
            state.messages.push_back(SimulationMessage {
                timestamp: *timestamp,
                from: from.clone(),
                to: to.clone(),
                topic: topic.clone(),
                payload: payload.clone(),
            });
        }
        SimulateEvent::Paused { elapsed_ms } => {
            if state.status == SimulationStatus::Running {
                state.status = SimulationStatus::Paused;
                state.freeze_elapsed(*elapsed_ms);
            }
        }
        SimulateEvent::Resumed { elapsed_ms } => {
            if state.status == SimulationStatus::Paused {
                state.status = SimulationStatus::Running;
                state.anchor_elapsed(*elapsed_ms);
            }
        }
        SimulateEvent::Stopped { elapsed_ms } => {
            if state.status.is_terminal() {
                debug!(current = ?state.status, "ignoring stop after terminal status");
                return;
            }
            state.status = SimulationStatus::Stopped;
            state.freeze_elapsed(*elapsed_ms);
            for node in state.nodes.values_mut() {
                node.status = SimNodeStatus::Offline;
            }
        }
        SimulateEvent::SpeedChanged { speed } => {
            if *speed > 0.0 {
                // Re-anchor first so time already accrued at the old speed
                // is not retroactively rescaled.
                if state.status == SimulationStatus::Running {
                    state.anchor_elapsed(None);
                }
                state.speed = *speed;
            }
        }
        SimulateEvent::TestResult { name, passed } => {
            state.test_summary.insert(name.clone(), *passed);
        }
        SimulateEvent::Complete { elapsed_ms, .. } => {
            if state.status.is_terminal() {
                debug!(current = ?state.status, "ignoring completion after terminal status");
                return;
            }
            state.status = SimulationStatus::Completed;
            state.freeze_elapsed(*elapsed_ms);
            for node in state.nodes.values_mut() {
                node.status = SimNodeStatus::Offline;
            }
        }
        SimulateEvent::Error { message } => {
            if state.status.is_terminal() {
                debug!("ignoring backend simulation error after terminal status");
                return;
            }
            state.status = SimulationStatus::Stopped;
            state.error = Some(message.clone());
            state.freeze_elapsed(None);
        }
        SimulateEvent::Unknown => {}
    }
}
