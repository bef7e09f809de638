use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{NodeId, SessionId};

/// Per-node build lifecycle, mirrored verbatim from backend events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeBuildStatus {
    #[default]
    Pending,
    Generating,
    Compiling,
    Simulating,
    Testing,
    Success,
    Failed,
    Skipped,
}

impl NodeBuildStatus {
    pub fn is_done(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildSessionStatus {
    #[default]
    Idle,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl BuildSessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Partial | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MemoryUsage {
    pub flash_used: u64,
    pub flash_limit: u64,
    pub ram_used: u64,
    pub ram_limit: u64,
}

impl MemoryUsage {
    pub fn flash_percent(&self) -> f64 {
        percent(self.flash_used, self.flash_limit)
    }

    pub fn ram_percent(&self) -> f64 {
        percent(self.ram_used, self.ram_limit)
    }
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        used as f64 / limit as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAssertionResult {
    pub name: String,
    pub pattern: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_line: Option<String>,
}

/// One iteration of the generate/compile/simulate/test loop for a node.
///
/// Records are keyed by iteration number and created on first reference
/// from whichever field arrives first; they are updated in place, never
/// removed. `simulation_output` is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeIteration {
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(default)]
    pub compile_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation_output: Option<String>,
    #[serde(default)]
    pub test_results: BTreeMap<String, TestAssertionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<MemoryUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBuildState {
    pub node_id: NodeId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub board_type: String,
    #[serde(default)]
    pub status: NodeBuildStatus,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub max_iterations: u32,
    #[serde(default)]
    pub iterations: BTreeMap<u32, NodeIteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_binary_path: Option<String>,
}

impl NodeBuildState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            description: String::new(),
            board_type: String::new(),
            status: NodeBuildStatus::Pending,
            current_iteration: 0,
            max_iterations: 0,
            iterations: BTreeMap::new(),
            final_binary_path: None,
        }
    }

    pub fn latest_iteration(&self) -> Option<&NodeIteration> {
        self.iterations.values().next_back()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAssertionSpec {
    pub name: String,
    pub pattern: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePlacement {
    pub node_id: NodeId,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_type: Option<String>,
    #[serde(default)]
    pub assertions: Vec<TestAssertionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    pub max_iterations: u32,
    pub simulation_timeout_seconds: f64,
    pub board_id: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            simulation_timeout_seconds: 10.0,
            board_id: "lm3s6965".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub description: String,
    pub board_id: String,
    pub nodes: Vec<NodePlacement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BuildSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartResponse {
    pub session_id: SessionId,
    pub status: String,
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub message: String,
}

/// Full build snapshot returned by `GET /build/{session_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    pub session_id: SessionId,
    pub status: BuildSessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    #[serde(default)]
    pub current_iteration: u32,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub nodes: HashMap<NodeId, NodeBuildState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Inbound build-stage events. Unknown types parse to `Unknown` and the
/// reducer treats them as no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BuildEvent {
    NodeStatus {
        node_id: NodeId,
        status: NodeBuildStatus,
        #[serde(default)]
        iteration: u32,
        #[serde(default)]
        max_iterations: u32,
    },
    LlmRequest {
        node_id: NodeId,
        iteration: u32,
        prompt: String,
    },
    LlmResponse {
        node_id: NodeId,
        iteration: u32,
        response: String,
    },
    CodeGenerated {
        node_id: NodeId,
        iteration: u32,
        code_preview: String,
    },
    CompileResult {
        node_id: NodeId,
        iteration: u32,
        success: bool,
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory: Option<MemoryUsage>,
    },
    SimulationOutput {
        node_id: NodeId,
        iteration: u32,
        line: String,
    },
    TestResult {
        node_id: NodeId,
        iteration: u32,
        assertion: String,
        pattern: String,
        passed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        matched_line: Option<String>,
    },
    NodeComplete {
        node_id: NodeId,
        status: NodeBuildStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iterations_used: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BuildComplete {
        status: BuildSessionStatus,
        #[serde(default)]
        succeeded: Vec<NodeId>,
        #[serde(default)]
        failed: Vec<NodeId>,
        #[serde(default)]
        skipped: Vec<NodeId>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
        message: String,
    },
    /// Catch-all for event types this client does not know. Substituted by
    /// the router on an unrecognized tag, never deserialized directly.
    #[serde(skip)]
    Unknown,
}
