use std::collections::{HashMap, HashSet};

use shared::{
    deploy::{
        CloudState, CloudStatus, DeployEvent, DeployStatusResponse, DeviceInfo, FlashProgress,
        NodeTelemetry,
    },
    domain::{NodeId, PortName},
};
use tracing::debug;

/// Per-node alert retention. Oldest entries fall off once the cap is hit;
/// entries below the cap are append-only and not deduplicated.
pub const ALERT_CAP: usize = 200;

/// Reconstructed deploy-stage state for one session.
#[derive(Debug, Clone, Default)]
pub struct DeployState {
    pub devices: Vec<DeviceInfo>,
    pub assignments: HashMap<PortName, NodeId>,
    /// Ports whose assignment entry is a local optimistic write awaiting
    /// backend confirmation. Cleared by the authoritative event, reverted
    /// if the REST call is rejected.
    pub optimistic_ports: HashSet<PortName>,
    pub flash: HashMap<PortName, FlashProgress>,
    pub cloud: CloudStatus,
    pub telemetry: HashMap<NodeId, NodeTelemetry>,
}

impl DeployState {
    pub fn from_snapshot(snapshot: DeployStatusResponse) -> Self {
        Self {
            devices: snapshot.devices,
            assignments: snapshot.assignments,
            optimistic_ports: HashSet::new(),
            flash: snapshot.flash_status,
            cloud: snapshot.cloud_status,
            telemetry: snapshot.telemetry,
        }
    }

    /// Replace the device list from a scan, preserving assignment markers
    /// for ports that are still present.
    pub fn replace_devices(&mut self, mut devices: Vec<DeviceInfo>) {
        for device in &mut devices {
            device.assigned_node = self.assignments.get(&device.port).cloned();
        }
        self.devices = devices;
    }

    /// Record an assignment locally before the backend confirms it.
    pub fn assign_optimistic(&mut self, port: PortName, node_id: NodeId) {
        self.set_assignment(&port, Some(node_id));
        self.optimistic_ports.insert(port);
    }

    /// Remove an assignment locally before the backend confirms it.
    pub fn unassign_optimistic(&mut self, port: &PortName) -> Option<NodeId> {
        let previous = self.set_assignment(port, None);
        self.optimistic_ports.insert(port.clone());
        previous
    }

    /// Undo an optimistic write the backend rejected. `previous` is the
    /// assignment that was in place before the write.
    pub fn revert_optimistic(&mut self, port: &PortName, previous: Option<NodeId>) {
        if self.optimistic_ports.remove(port) {
            self.set_assignment(port, previous);
        }
    }

    pub fn flashing_count(&self) -> usize {
        self.flash
            .values()
            .filter(|p| !p.status.is_terminal())
            .count()
    }

    pub fn online_count(&self) -> usize {
        self.telemetry.values().filter(|t| t.online).count()
    }

    fn set_assignment(&mut self, port: &PortName, node_id: Option<NodeId>) -> Option<NodeId> {
        let previous = match &node_id {
            Some(node_id) => self.assignments.insert(port.clone(), node_id.clone()),
            None => self.assignments.remove(port),
        };
        if let Some(device) = self.devices.iter_mut().find(|d| &d.port == port) {
            device.assigned_node = node_id;
        }
        previous
    }
}

fn apply_flash(state: &mut DeployState, progress: &FlashProgress) {
    if let Some(current) = state.flash.get(&progress.port) {
        // A terminal result is never walked back by a stale in-flight
        // frame that was still queued when the flash finished.
        if current.status.is_terminal() && !progress.status.is_terminal() {
            debug!(
                port = %progress.port,
                stale = ?progress.status,
                "dropping stale flash progress after terminal status"
            );
            return;
        }
    }
    state.flash.insert(progress.port.clone(), progress.clone());
}

pub fn apply(state: &mut DeployState, event: &DeployEvent) {
    match event {
        DeployEvent::AssignmentUpdated { port, node_id } => {
            state.optimistic_ports.remove(port);
            state.set_assignment(port, Some(node_id.clone()));
        }
        DeployEvent::AssignmentRemoved { port } => {
            state.optimistic_ports.remove(port);
            state.set_assignment(port, None);
        }
        DeployEvent::FlashPreparing(p)
        | DeployEvent::FlashErasing(p)
        | DeployEvent::FlashWriting(p)
        | DeployEvent::FlashVerifying(p)
        | DeployEvent::FlashComplete(p)
        | DeployEvent::FlashError(p) => apply_flash(state, p),
        DeployEvent::CloudStatus(status) => {
            if state.cloud.status.is_final() && !status.status.is_final() {
                debug!(incoming = ?status.status, "ignoring cloud status after destroy");
                return;
            }
            state.cloud = status.clone();
        }
        DeployEvent::TerraformProgress {
            status,
            step,
            progress_percent,
            message,
            ..
        } => {
            if state.cloud.status.is_final() {
                debug!("ignoring terraform progress after destroy");
                return;
            }
            state.cloud.status = *status;
            state.cloud.step = step.clone();
            state.cloud.progress_percent = *progress_percent;
            state.cloud.message = message.clone();
        }
        DeployEvent::TerraformOutputs(outputs) => {
            state.cloud.outputs = Some(outputs.clone());
        }
        DeployEvent::TerraformError { error } => {
            // A failure report racing a completed destroy is stale; the
            // infrastructure is already gone.
            if state.cloud.status.is_final() {
                debug!("ignoring terraform error after destroy");
                return;
            }
            state.cloud.status = CloudState::Error;
            state.cloud.message = Some(error.clone());
        }
        DeployEvent::Telemetry {
            node_id,
            online,
            last_seen,
            readings,
            alerts,
        } => {
            let entry = state
                .telemetry
                .entry(node_id.clone())
                .or_insert_with(|| NodeTelemetry::new(node_id.clone()));
            entry.online = *online;
            if last_seen.is_some() {
                entry.last_seen = *last_seen;
            }
            if !readings.is_empty() {
                entry.latest_readings = readings.clone();
            }
            entry.alerts.extend(alerts.iter().cloned());
            if entry.alerts.len() > ALERT_CAP {
                let excess = entry.alerts.len() - ALERT_CAP;
                entry.alerts.drain(..excess);
            }
        }
        DeployEvent::Unknown => {}
    }
}
