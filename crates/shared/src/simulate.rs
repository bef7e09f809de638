use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NodeId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimulationStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl SimulationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimNodeStatus {
    Online,
    #[default]
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationNode {
    pub node_id: NodeId,
    #[serde(default)]
    pub status: SimNodeStatus,
    #[serde(default)]
    pub latest_readings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub message_count: u64,
}

impl SimulationNode {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: SimNodeStatus::Offline,
            latest_readings: BTreeMap::new(),
            message_count: 0,
        }
    }
}

/// One inter-node message observed during simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationMessage {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub from: NodeId,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateStartRequest {
    pub session_id: SessionId,
    pub timeout_seconds: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateSpeedRequest {
    pub speed: f64,
}

/// Full simulation snapshot returned by `GET /simulate/{session_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulateStatusResponse {
    pub session_id: SessionId,
    pub status: SimulationStatus,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub elapsed_time_ms: u64,
    #[serde(default)]
    pub nodes: HashMap<NodeId, SimulationNode>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub test_summary: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SimulateEvent {
    Started {
        nodes: Vec<NodeId>,
        speed: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<f64>,
    },
    NodeStatus {
        node_id: NodeId,
        status: SimNodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        readings: Option<BTreeMap<String, serde_json::Value>>,
    },
    Tick {
        elapsed_ms: u64,
    },
    Message {
        from: NodeId,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
    Paused {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
    },
    Resumed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
    },
    Stopped {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
    },
    SpeedChanged {
        speed: f64,
    },
    TestResult {
        name: String,
        passed: bool,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        #[serde(default)]
        messages_sent: u64,
        #[serde(default)]
        tests_passed: u32,
        #[serde(default)]
        tests_failed: u32,
    },
    Error {
        message: String,
    },
    /// Catch-all for event types this client does not know. Substituted by
    /// the router on an unrecognized tag, never deserialized directly.
    #[serde(skip)]
    Unknown,
}
