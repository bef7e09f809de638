use std::collections::HashMap;

use shared::{
    build::{
        BuildEvent, BuildSessionStatus, BuildStatusResponse, NodeBuildState, NodeBuildStatus,
        NodeIteration, TestAssertionResult,
    },
    domain::NodeId,
};
use tracing::debug;

/// Reconstructed build-stage state for one session.
#[derive(Debug, Clone, Default)]
pub struct BuildState {
    pub status: BuildSessionStatus,
    pub nodes: HashMap<NodeId, NodeBuildState>,
    pub current_node: Option<NodeId>,
    pub error: Option<String>,
}

impl BuildState {
    /// Completed/total counts are always a filter-count over the node map,
    /// never an independently maintained counter.
    pub fn completed_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n.status, NodeBuildStatus::Success | NodeBuildStatus::Skipped))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.status == NodeBuildStatus::Failed)
            .count()
    }

    pub fn done_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status.is_done()).count()
    }

    pub fn total_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn completion_percent(&self) -> f64 {
        let total = self.total_count();
        if total == 0 {
            0.0
        } else {
            self.done_count() as f64 / total as f64 * 100.0
        }
    }

    /// Wholesale state replacement from a REST snapshot, bypassing the
    /// event path. Used after reconnect gaps and session re-entry.
    pub fn from_snapshot(snapshot: BuildStatusResponse) -> Self {
        Self {
            status: snapshot.status,
            nodes: snapshot.nodes,
            current_node: snapshot.current_node,
            error: snapshot.error_message,
        }
    }
}

fn node_entry<'a>(state: &'a mut BuildState, node_id: &NodeId) -> &'a mut NodeBuildState {
    state
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| NodeBuildState::new(node_id.clone()))
}

fn iteration_entry(node: &mut NodeBuildState, iteration: u32) -> &mut NodeIteration {
    node.iterations.entry(iteration).or_insert_with(|| NodeIteration {
        iteration,
        ..NodeIteration::default()
    })
}

pub fn apply(state: &mut BuildState, event: &BuildEvent) {
    match event {
        BuildEvent::NodeStatus {
            node_id,
            status,
            iteration,
            max_iterations,
        } => {
            let node = node_entry(state, node_id);
            node.status = *status;
            if *iteration > 0 {
                node.current_iteration = *iteration;
            }
            if *max_iterations > 0 {
                node.max_iterations = *max_iterations;
            }
            state.current_node = if status.is_done() {
                None
            } else {
                Some(node_id.clone())
            };
        }
        BuildEvent::LlmRequest {
            node_id,
            iteration,
            prompt,
        } => {
            let node = node_entry(state, node_id);
            iteration_entry(node, *iteration).prompt = Some(prompt.clone());
        }
        BuildEvent::LlmResponse {
            node_id,
            iteration,
            response,
        } => {
            let node = node_entry(state, node_id);
            iteration_entry(node, *iteration).response = Some(response.clone());
        }
        BuildEvent::CodeGenerated {
            node_id,
            iteration,
            code_preview,
        } => {
            let node = node_entry(state, node_id);
            iteration_entry(node, *iteration).generated_code = Some(code_preview.clone());
        }
        BuildEvent::CompileResult {
            node_id,
            iteration,
            success,
            output,
            memory,
        } => {
            let node = node_entry(state, node_id);
            let record = iteration_entry(node, *iteration);
            record.compile_success = *success;
            record.compile_output = Some(output.clone());
            if memory.is_some() {
                record.memory_usage = *memory;
            }
        }
        BuildEvent::SimulationOutput {
            node_id,
            iteration,
            line,
        } => {
            let node = node_entry(state, node_id);
            let record = iteration_entry(node, *iteration);
            match &mut record.simulation_output {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(line);
                }
                None => record.simulation_output = Some(line.clone()),
            }
        }
        BuildEvent::TestResult {
            node_id,
            iteration,
            assertion,
            pattern,
            passed,
            matched_line,
        } => {
            let node = node_entry(state, node_id);
            iteration_entry(node, *iteration).test_results.insert(
                assertion.clone(),
                TestAssertionResult {
                    name: assertion.clone(),
                    pattern: pattern.clone(),
                    passed: *passed,
                    matched_line: matched_line.clone(),
                },
            );
        }
        BuildEvent::NodeComplete {
            node_id,
            status,
            iterations_used,
            error,
        } => {
            let node = node_entry(state, node_id);
            node.status = *status;
            if let Some(used) = iterations_used {
                node.current_iteration = *used;
            }
            if let Some(message) = error {
                let iteration = node.current_iteration.max(1);
                iteration_entry(node, iteration).error_message = Some(message.clone());
            }
            if state.current_node.as_ref() == Some(node_id) {
                state.current_node = None;
            }
        }
        BuildEvent::BuildComplete { status, .. } => {
            // Session-level terminal status is set only by this explicit
            // event; once terminal it stays put, so a completion arriving
            // after a local cancellation cannot resurrect the run.
            if state.status.is_terminal() {
                debug!(
                    current = ?state.status,
                    incoming = ?status,
                    "ignoring build completion after terminal status"
                );
                return;
            }
            state.status = *status;
            state.current_node = None;
        }
        BuildEvent::Error {
            node_id,
            iteration,
            message,
        } => match node_id {
            Some(node_id) => {
                let node = node_entry(state, node_id);
                let iteration = iteration.unwrap_or_else(|| node.current_iteration.max(1));
                iteration_entry(node, iteration).error_message = Some(message.clone());
            }
            None => {
                if state.status.is_terminal() {
                    debug!("ignoring backend build error after terminal status");
                    return;
                }
                state.status = BuildSessionStatus::Failed;
                state.error = Some(message.clone());
                state.current_node = None;
            }
        },
        BuildEvent::Unknown => {}
    }
}
