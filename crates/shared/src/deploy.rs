use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{NodeId, PortName, SessionId};

/// Connected USB device as reported by a scan. The device list is replaced
/// wholesale on every scan; per-port assignments live beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub port: PortName,
    pub board_type: String,
    pub chip_name: String,
    pub vid: String,
    pub pid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlashStatus {
    #[default]
    Idle,
    Preparing,
    Erasing,
    Writing,
    Verifying,
    Complete,
    Error,
}

impl FlashStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashProgress {
    pub port: PortName,
    pub node_id: NodeId,
    pub status: FlashStatus,
    #[serde(default)]
    pub percent: u8,
    #[serde(default)]
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CloudState {
    #[default]
    Idle,
    Initializing,
    Planning,
    Applying,
    Deployed,
    Destroying,
    Destroyed,
    Error,
}

impl CloudState {
    /// `destroyed` is final: nothing legitimately follows it short of an
    /// explicit reset, so late failure events are ignored there.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TerraformOutputs {
    #[serde(default)]
    pub server_ip: String,
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub mqtt_broker: String,
    #[serde(default)]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_ws_url: String,
    #[serde(default)]
    pub ssh_command: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub swarm_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CloudStatus {
    pub status: CloudState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<TerraformOutputs>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTelemetry {
    pub node_id: NodeId,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_readings: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub alerts: Vec<String>,
}

impl NodeTelemetry {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            online: false,
            last_seen: None,
            latest_readings: BTreeMap::new(),
            alerts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub node_id: NodeId,
    pub port: PortName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashRequest {
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub port: PortName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashAllRequest {
    pub assignments: Vec<NodeAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudDeployRequest {
    pub session_id: SessionId,
    pub swarm_id: String,
    pub region: String,
    pub instance_type: String,
    pub mqtt_port: u16,
    pub http_port: u16,
    pub auto_destroy_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCheckResponse {
    pub terraform_installed: bool,
    pub aws_configured: bool,
    pub ready: bool,
    #[serde(default)]
    pub messages: Vec<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    pub aws_region: String,
    pub instance_type: String,
    pub auto_destroy_hours: u32,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            aws_region: "us-east-1".to_string(),
            instance_type: "t3.micro".to_string(),
            auto_destroy_hours: 2,
        }
    }
}

/// Full deploy snapshot returned by `GET /deploy/{session_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployStatusResponse {
    pub session_id: SessionId,
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
    #[serde(default)]
    pub assignments: HashMap<PortName, NodeId>,
    #[serde(default)]
    pub flash_status: HashMap<PortName, FlashProgress>,
    #[serde(default)]
    pub cloud_status: CloudStatus,
    #[serde(default)]
    pub telemetry: HashMap<NodeId, NodeTelemetry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DeployEvent {
    AssignmentUpdated {
        port: PortName,
        node_id: NodeId,
    },
    AssignmentRemoved {
        port: PortName,
    },
    FlashPreparing(FlashProgress),
    FlashErasing(FlashProgress),
    FlashWriting(FlashProgress),
    FlashVerifying(FlashProgress),
    FlashComplete(FlashProgress),
    FlashError(FlashProgress),
    CloudStatus(CloudStatus),
    TerraformProgress {
        status: CloudState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(default)]
        progress_percent: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TerraformOutputs(TerraformOutputs),
    TerraformError {
        error: String,
    },
    Telemetry {
        node_id: NodeId,
        #[serde(default)]
        online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen: Option<DateTime<Utc>>,
        #[serde(default)]
        readings: BTreeMap<String, serde_json::Value>,
        #[serde(default)]
        alerts: Vec<String>,
    },
    /// Catch-all for event types this client does not know. Substituted by
    /// the router on an unrecognized tag, never deserialized directly.
    #[serde(skip)]
    Unknown,
}
