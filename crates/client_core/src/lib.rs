//! Client-side session state reconciliation for the firmware pipeline.
//!
//! The [`SessionController`] owns one websocket transport, routes inbound
//! stage events into pure reducers, and wraps the backend's REST surface.
//! UI layers subscribe to a broadcast of [`StateUpdate`] notifications and
//! re-read state through the snapshot accessors; they never mutate it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{
    build::{BuildStartRequest, BuildStartResponse, BuildStatusResponse},
    deploy::{
        CloudCheckResponse, CloudDeployRequest, CloudStatus, DeploySettings, DeployStatusResponse,
        DeviceInfo, FlashAllRequest, FlashRequest, NodeAssignment, NodeTelemetry,
    },
    domain::{NodeId, PortName, SessionId, Stage},
    envelope::{ClientFrame, StageEvent},
    error::ApiError,
    simulate::{SimulateSpeedRequest, SimulateStartRequest, SimulateStatusResponse,
        SimulationMessage},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod reducers;
pub mod router;
pub mod scanner;
pub mod transport;

use reducers::{build::BuildState, deploy::DeployState, simulate::SimulateState};
use scanner::AutoScanTimer;
use transport::Transport;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
const INBOUND_BUFFER: usize = 256;
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// REST call failure. Carries the decoded backend error body when the
/// server provided one.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no session open")]
    NoSession,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Api(ApiError),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
}

/// Notifications pushed to subscribers. State itself is pulled through the
/// snapshot accessors; these only say that something changed.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    ConnectionChanged(bool),
    StageChanged(Stage),
    RequestRejected(String),
}

struct ControllerState {
    session_id: Option<SessionId>,
    active_stage: Stage,
    build: BuildState,
    simulate: SimulateState,
    deploy: DeployState,
    auto_scan_interval_ms: u64,
    auto_scan_enabled: bool,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            session_id: None,
            active_stage: Stage::Build,
            build: BuildState::default(),
            simulate: SimulateState::default(),
            deploy: DeployState::default(),
            auto_scan_interval_ms: scanner::DEFAULT_SCAN_INTERVAL_MS,
            auto_scan_enabled: true,
        }
    }
}

pub struct SessionController {
    http: Client,
    server_url: String,
    inner: Mutex<ControllerState>,
    transport: Mutex<Option<Transport>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scanner: Mutex<Option<AutoScanTimer>>,
    updates: broadcast::Sender<StateUpdate>,
}

impl SessionController {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            inner: Mutex::new(ControllerState::new()),
            transport: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            scanner: Mutex::new(None),
            updates,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Attach to a session: connect the websocket, start the frame pump and
    /// keepalive, and resynchronize the active stage on every reconnect.
    /// Replaces any previously open session.
    pub async fn open_session(self: &Arc<Self>, session_id: SessionId) -> Result<()> {
        self.close_session().await;

        {
            let mut state = self.inner.lock().await;
            state.session_id = Some(session_id.clone());
        }

        let ws_url = transport::websocket_url(&self.server_url, session_id.as_str())?;
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
        let transport = Transport::spawn(ws_url, inbound_tx);
        let mut connection = transport.connection_watch();

        let pump = {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(text) = inbound_rx.recv().await {
                    controller.handle_frame(&text).await;
                }
            })
        };

        let keepalive = {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let guard = controller.transport.lock().await;
                    if let Some(transport) = guard.as_ref() {
                        transport.send(ClientFrame::Ping);
                    }
                }
            })
        };

        let watcher = {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                let mut was_connected = *connection.borrow();
                while connection.changed().await.is_ok() {
                    let connected = *connection.borrow();
                    if connected == was_connected {
                        continue;
                    }
                    was_connected = connected;
                    let _ = controller
                        .updates
                        .send(StateUpdate::ConnectionChanged(connected));
                    if connected {
                        // Events may have been missed while the socket was
                        // down; replace the active stage from a snapshot
                        // rather than guessing at the gap.
                        if let Err(err) = controller.resync_active_stage().await {
                            warn!(error = %err, "post-reconnect resync failed");
                        }
                    }
                }
            })
        };

        *self.transport.lock().await = Some(transport);
        self.tasks.lock().await.extend([pump, keepalive, watcher]);
        info!(session_id = %session_id, "session opened");
        Ok(())
    }

    /// Detach from the current session, tearing down the transport and all
    /// background tasks. Stage state resets to defaults.
    pub async fn close_session(&self) {
        if let Some(timer) = self.scanner.lock().await.take() {
            timer.stop();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(transport) = self.transport.lock().await.take() {
            transport.shutdown();
            let _ = self.updates.send(StateUpdate::ConnectionChanged(false));
        }
        let mut state = self.inner.lock().await;
        if state.session_id.take().is_some() {
            info!("session closed");
        }
        state.build = BuildState::default();
        state.simulate = SimulateState::default();
        state.deploy = DeployState::default();
    }

    pub async fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .await
            .as_ref()
            .is_some_and(Transport::is_connected)
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.inner.lock().await.session_id.clone()
    }

    pub async fn active_stage(&self) -> Stage {
        self.inner.lock().await.active_stage
    }

    /// Switch the active stage. The new stage is resynchronized from a
    /// snapshot, and the deploy auto-scan timer follows the stage.
    pub async fn set_active_stage(self: &Arc<Self>, stage: Stage) -> Result<(), RequestError> {
        let changed = {
            let mut state = self.inner.lock().await;
            let changed = state.active_stage != stage;
            state.active_stage = stage;
            changed
        };
        if !changed {
            return Ok(());
        }
        match stage {
            Stage::Deploy => self.start_auto_scan_if_enabled().await,
            _ => {
                if let Some(timer) = self.scanner.lock().await.take() {
                    timer.stop();
                }
            }
        }
        self.resync_active_stage().await
    }

    // ---- state accessors -------------------------------------------------

    pub async fn build_state(&self) -> BuildState {
        self.inner.lock().await.build.clone()
    }

    pub async fn simulate_state(&self) -> SimulateState {
        self.inner.lock().await.simulate.clone()
    }

    pub async fn deploy_state(&self) -> DeployState {
        self.inner.lock().await.deploy.clone()
    }

    // ---- inbound frames --------------------------------------------------

    async fn handle_frame(&self, text: &str) {
        let mut state = self.inner.lock().await;
        let Some(event) = router::route(text, state.active_stage) else {
            return;
        };
        let stage = event.stage();
        match event {
            StageEvent::Build(event) => reducers::build::apply(&mut state.build, &event),
            StageEvent::Simulate(event) => reducers::simulate::apply(&mut state.simulate, &event),
            StageEvent::Deploy(event) => reducers::deploy::apply(&mut state.deploy, &event),
        }
        drop(state);
        let _ = self.updates.send(StateUpdate::StageChanged(stage));
    }

    // ---- snapshot resynchronization --------------------------------------

    async fn resync_active_stage(&self) -> Result<(), RequestError> {
        let stage = self.inner.lock().await.active_stage;
        match stage {
            Stage::Build => self.load_build_snapshot().await.map(|_| ()),
            Stage::Simulate => self.load_simulate_snapshot().await.map(|_| ()),
            Stage::Deploy => self.load_deploy_snapshot().await.map(|_| ()),
        }
    }

    pub async fn load_build_snapshot(&self) -> Result<BuildStatusResponse, RequestError> {
        let sid = self.require_session().await?;
        let snapshot: BuildStatusResponse =
            self.get(&format!("/build/{sid}/status")).await?;
        {
            let mut state = self.inner.lock().await;
            state.build = BuildState::from_snapshot(snapshot.clone());
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Build));
        Ok(snapshot)
    }

    pub async fn load_simulate_snapshot(&self) -> Result<SimulateStatusResponse, RequestError> {
        let sid = self.require_session().await?;
        let snapshot: SimulateStatusResponse =
            self.get(&format!("/simulate/{sid}/status")).await?;
        {
            let mut state = self.inner.lock().await;
            state.simulate = SimulateState::from_snapshot(snapshot.clone());
        }
        let _ = self
            .updates
            .send(StateUpdate::StageChanged(Stage::Simulate));
        Ok(snapshot)
    }

    pub async fn load_deploy_snapshot(&self) -> Result<DeployStatusResponse, RequestError> {
        let sid = self.require_session().await?;
        let snapshot: DeployStatusResponse =
            self.get(&format!("/deploy/{sid}/status")).await?;
        {
            let mut state = self.inner.lock().await;
            state.deploy = DeployState::from_snapshot(snapshot.clone());
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));
        Ok(snapshot)
    }

    // ---- build stage -----------------------------------------------------

    pub async fn start_build(
        &self,
        mut request: BuildStartRequest,
    ) -> Result<BuildStartResponse, RequestError> {
        if request.session_id.is_none() {
            request.session_id = self.inner.lock().await.session_id.clone();
        }
        let response: BuildStartResponse = self.post("/build/start", &request).await?;
        {
            let mut state = self.inner.lock().await;
            state.build = BuildState::default();
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Build));
        Ok(response)
    }

    pub async fn stop_build(&self) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/build/{sid}/stop")).await
    }

    pub async fn retry_node(&self, node_id: &NodeId) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/build/{sid}/node/{node_id}/retry"))
            .await
    }

    pub async fn skip_node(&self, node_id: &NodeId) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/build/{sid}/node/{node_id}/skip"))
            .await
    }

    // ---- simulate stage --------------------------------------------------

    pub async fn start_simulation(
        &self,
        timeout_seconds: f64,
        speed: f64,
    ) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        let request = SimulateStartRequest {
            session_id: sid,
            timeout_seconds,
            speed,
        };
        self.post_no_body("/simulate/start", &request).await
    }

    pub async fn pause_simulation(&self) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/simulate/{sid}/pause")).await
    }

    pub async fn resume_simulation(&self) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/simulate/{sid}/resume")).await
    }

    pub async fn stop_simulation(&self) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/simulate/{sid}/stop")).await
    }

    pub async fn set_simulation_speed(&self, speed: f64) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_no_body(
            &format!("/simulate/{sid}/speed"),
            &SimulateSpeedRequest { speed },
        )
        .await
    }

    /// Page through the backend's full message history; the in-memory
    /// window only keeps the most recent messages.
    pub async fn fetch_messages(
        &self,
        node_id: Option<&NodeId>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SimulationMessage>, RequestError> {
        let sid = self.require_session().await?;
        let mut url = format!(
            "{}/simulate/{sid}/messages?limit={limit}&offset={offset}",
            self.server_url
        );
        if let Some(node_id) = node_id {
            url.push_str(&format!("&node_id={node_id}"));
        }
        let result = match self.http.get(url).send().await {
            Ok(response) => decode_response(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }

    // ---- deploy stage ----------------------------------------------------

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, RequestError> {
        let sid = self.require_session().await?;
        let devices: Vec<DeviceInfo> = self
            .get(&format!("/deploy/devices?session_id={sid}"))
            .await?;
        self.replace_devices(devices.clone()).await;
        Ok(devices)
    }

    pub async fn scan_devices(&self) -> Result<Vec<DeviceInfo>, RequestError> {
        let result = match self
            .http
            .post(format!("{}/deploy/devices/scan", self.server_url))
            .send()
            .await
        {
            Ok(response) => decode_response(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        let devices: Vec<DeviceInfo> = result.map_err(|err| self.reject(err))?;
        self.replace_devices(devices.clone()).await;
        Ok(devices)
    }

    async fn replace_devices(&self, devices: Vec<DeviceInfo>) {
        {
            let mut state = self.inner.lock().await;
            state.deploy.replace_devices(devices);
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));
    }

    /// Assign a node to a port. Applied locally before the backend
    /// confirms; reverted and reported if the backend rejects it.
    pub async fn assign_port(
        &self,
        port: PortName,
        node_id: NodeId,
    ) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        let previous = {
            let mut state = self.inner.lock().await;
            let previous = state.deploy.assignments.get(&port).cloned();
            state.deploy.assign_optimistic(port.clone(), node_id.clone());
            previous
        };
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));

        let request = NodeAssignment {
            node_id,
            port: port.clone(),
            firmware_path: None,
        };
        match self
            .post_no_body(&format!("/deploy/{sid}/assign"), &request)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.revert_assignment(&port, previous).await;
                Err(err)
            }
        }
    }

    pub async fn unassign_port(&self, port: PortName) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        let previous = {
            let mut state = self.inner.lock().await;
            state.deploy.unassign_optimistic(&port)
        };
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));

        if let Err(err) = self.delete_empty(&format!("/deploy/{sid}/assign/{port}")).await {
            self.revert_assignment(&port, previous).await;
            return Err(err);
        }
        Ok(())
    }

    async fn revert_assignment(&self, port: &PortName, previous: Option<NodeId>) {
        {
            let mut state = self.inner.lock().await;
            state.deploy.revert_optimistic(port, previous);
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));
    }

    pub async fn flash_node(
        &self,
        node_id: NodeId,
        port: PortName,
    ) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        let request = FlashRequest {
            session_id: sid.clone(),
            node_id,
            port,
        };
        self.post_no_body(&format!("/deploy/{sid}/flash"), &request)
            .await
    }

    pub async fn flash_all(
        &self,
        assignments: Vec<NodeAssignment>,
    ) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_no_body(
            &format!("/deploy/{sid}/flash/all"),
            &FlashAllRequest { assignments },
        )
        .await
    }

    pub async fn cloud_check(&self) -> Result<CloudCheckResponse, RequestError> {
        self.get("/deploy/cloud/check").await
    }

    pub async fn cloud_start(
        &self,
        request: CloudDeployRequest,
    ) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_no_body(&format!("/deploy/{sid}/cloud/start"), &request)
            .await
    }

    pub async fn cloud_destroy(&self) -> Result<(), RequestError> {
        let sid = self.require_session().await?;
        self.post_empty(&format!("/deploy/{sid}/cloud/destroy?confirm=true"))
            .await
    }

    pub async fn cloud_status(&self) -> Result<CloudStatus, RequestError> {
        let sid = self.require_session().await?;
        let status: CloudStatus = self.get(&format!("/deploy/{sid}/cloud/status")).await?;
        {
            let mut state = self.inner.lock().await;
            state.deploy.cloud = status.clone();
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));
        Ok(status)
    }

    pub async fn deploy_settings(&self) -> Result<DeploySettings, RequestError> {
        let sid = self.require_session().await?;
        self.get(&format!("/deploy/{sid}/settings")).await
    }

    pub async fn update_deploy_settings(
        &self,
        settings: &DeploySettings,
    ) -> Result<DeploySettings, RequestError> {
        let sid = self.require_session().await?;
        self.post(&format!("/deploy/{sid}/settings"), settings).await
    }

    pub async fn fetch_telemetry(
        &self,
    ) -> Result<std::collections::HashMap<NodeId, NodeTelemetry>, RequestError> {
        let sid = self.require_session().await?;
        let telemetry: std::collections::HashMap<NodeId, NodeTelemetry> =
            self.get(&format!("/deploy/{sid}/telemetry")).await?;
        {
            let mut state = self.inner.lock().await;
            state.deploy.telemetry = telemetry.clone();
        }
        let _ = self.updates.send(StateUpdate::StageChanged(Stage::Deploy));
        Ok(telemetry)
    }

    // ---- auto-scan -------------------------------------------------------

    pub async fn enable_auto_scan(self: &Arc<Self>, interval_ms: u64) {
        {
            let mut state = self.inner.lock().await;
            state.auto_scan_enabled = true;
            state.auto_scan_interval_ms = AutoScanTimer::clamp_interval(interval_ms);
        }
        if self.inner.lock().await.active_stage == Stage::Deploy {
            self.start_auto_scan_if_enabled().await;
        }
    }

    pub async fn disable_auto_scan(&self) {
        self.inner.lock().await.auto_scan_enabled = false;
        if let Some(timer) = self.scanner.lock().await.take() {
            timer.stop();
        }
    }

    async fn start_auto_scan_if_enabled(self: &Arc<Self>) {
        let (enabled, interval_ms) = {
            let state = self.inner.lock().await;
            (state.auto_scan_enabled, state.auto_scan_interval_ms)
        };
        if !enabled {
            return;
        }
        let mut guard = self.scanner.lock().await;
        let timer = guard.get_or_insert_with(|| {
            let weak = Arc::downgrade(self);
            AutoScanTimer::new(move || {
                let weak = weak.clone();
                async move {
                    let Some(controller) = weak.upgrade() else {
                        return;
                    };
                    if let Err(err) = controller.scan_devices().await {
                        debug!(error = %err, "auto-scan failed");
                    }
                }
            })
        });
        timer.start(interval_ms);
    }

    // ---- plumbing --------------------------------------------------------

    async fn require_session(&self) -> Result<SessionId, RequestError> {
        self.inner
            .lock()
            .await
            .session_id
            .clone()
            .ok_or_else(|| self.reject(RequestError::NoSession))
    }

    /// Surface a request failure on the update feed. Every REST helper
    /// routes its error through here exactly once.
    fn reject(&self, err: RequestError) -> RequestError {
        let _ = self
            .updates
            .send(StateUpdate::RequestRejected(err.to_string()));
        err
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, RequestError> {
        let result = match self
            .http
            .get(format!("{}{path}", self.server_url))
            .send()
            .await
        {
            Ok(response) => decode_response(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RequestError> {
        let result = match self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await
        {
            Ok(response) => decode_response(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }

    async fn post_no_body<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), RequestError> {
        let result = match self
            .http
            .post(format!("{}{path}", self.server_url))
            .json(body)
            .send()
            .await
        {
            Ok(response) => decode_empty(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }

    async fn post_empty(&self, path: &str) -> Result<(), RequestError> {
        let result = match self
            .http
            .post(format!("{}{path}", self.server_url))
            .send()
            .await
        {
            Ok(response) => decode_empty(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }

    async fn delete_empty(&self, path: &str) -> Result<(), RequestError> {
        let result = match self
            .http
            .delete(format!("{}{path}", self.server_url))
            .send()
            .await
        {
            Ok(response) => decode_empty(response).await,
            Err(err) => Err(RequestError::Http(err)),
        };
        result.map_err(|err| self.reject(err))
    }
}

async fn decode_response<R: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<R, RequestError> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        Err(decode_error(response).await)
    }
}

async fn decode_empty(response: reqwest::Response) -> Result<(), RequestError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(decode_error(response).await)
    }
}

async fn decode_error(response: reqwest::Response) -> RequestError {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(body) => RequestError::Api(body),
        Err(_) => RequestError::Status(status),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/build_reducer_tests.rs"]
mod build_reducer_tests;

#[cfg(test)]
#[path = "tests/simulate_reducer_tests.rs"]
mod simulate_reducer_tests;

#[cfg(test)]
#[path = "tests/deploy_reducer_tests.rs"]
mod deploy_reducer_tests;

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod router_tests;

#[cfg(test)]
#[path = "tests/scanner_tests.rs"]
mod scanner_tests;

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod transport_tests;
