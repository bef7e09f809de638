use super::*;
use std::collections::HashMap;

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use shared::{
    build::{BuildSessionStatus, NodeBuildState, NodeBuildStatus},
    deploy::CloudStatus,
    error::ErrorCode,
};
use tokio::{net::TcpListener, time::timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

fn port(p: &str) -> PortName {
    PortName::from(p)
}

async fn build_status(Path(sid): Path<String>) -> Json<BuildStatusResponse> {
    let mut nodes = HashMap::new();
    let mut state = NodeBuildState::new(node("sensor-1"));
    state.status = NodeBuildStatus::Success;
    nodes.insert(node("sensor-1"), state);
    Json(BuildStatusResponse {
        session_id: SessionId::from(sid.as_str()),
        status: BuildSessionStatus::Running,
        current_node: None,
        current_iteration: 1,
        completed_count: 1,
        total_count: 1,
        nodes,
        error_message: None,
    })
}

async fn deploy_status(Path(sid): Path<String>) -> Json<DeployStatusResponse> {
    Json(DeployStatusResponse {
        session_id: SessionId::from(sid.as_str()),
        devices: vec![DeviceInfo {
            port: port("COM3"),
            board_type: "esp32".into(),
            chip_name: "ESP32-S3".into(),
            vid: "303a".into(),
            pid: "1001".into(),
            assigned_node: None,
        }],
        assignments: HashMap::new(),
        flash_status: HashMap::new(),
        cloud_status: CloudStatus::default(),
        telemetry: HashMap::new(),
    })
}

async fn assign(
    Path(_sid): Path<String>,
    Json(assignment): Json<NodeAssignment>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    if assignment.port.as_str() == "COM9" {
        return Err((
            StatusCode::CONFLICT,
            Json(ApiError::new(ErrorCode::Conflict, "port busy")),
        ));
    }
    Ok(StatusCode::OK)
}

async fn unassign(Path((_sid, _port)): Path<(String, String)>) -> StatusCode {
    StatusCode::OK
}

async fn stop_build(Path(_sid): Path<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::CONFLICT,
        Json(ApiError::new(ErrorCode::Conflict, "no build running")),
    )
}

async fn scan() -> Json<Vec<DeviceInfo>> {
    Json(vec![
        DeviceInfo {
            port: port("COM3"),
            board_type: "esp32".into(),
            chip_name: "ESP32-S3".into(),
            vid: "303a".into(),
            pid: "1001".into(),
            assigned_node: None,
        },
        DeviceInfo {
            port: port("COM7"),
            board_type: "esp32".into(),
            chip_name: "ESP32-C3".into(),
            vid: "303a".into(),
            pid: "1001".into(),
            assigned_node: None,
        },
    ])
}

async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/build/:sid/status", get(build_status))
        .route("/build/:sid/stop", post(stop_build))
        .route("/deploy/:sid/status", get(deploy_status))
        .route("/deploy/:sid/assign", post(assign))
        .route("/deploy/:sid/assign/:port", delete(unassign))
        .route("/deploy/devices/scan", post(scan));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn open_controller(server_url: &str) -> Arc<SessionController> {
    let controller = SessionController::new(server_url);
    controller.disable_auto_scan().await;
    controller
        .open_session(SessionId::from("s1"))
        .await
        .unwrap();
    controller
}

#[tokio::test(flavor = "multi_thread")]
async fn operations_without_a_session_fail() {
    let controller = SessionController::new("http://127.0.0.1:1");
    let err = controller
        .assign_port(port("COM3"), node("n1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::NoSession));
}

#[tokio::test(flavor = "multi_thread")]
async fn build_snapshot_replaces_reducer_state() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;

    // Seed stale local state that the snapshot must wipe out.
    {
        let mut state = controller.inner.lock().await;
        reducers::build::apply(
            &mut state.build,
            &shared::build::BuildEvent::NodeStatus {
                node_id: node("stale"),
                status: NodeBuildStatus::Generating,
                iteration: 1,
                max_iterations: 3,
            },
        );
    }

    controller.load_build_snapshot().await.unwrap();
    let build = controller.build_state().await;
    assert_eq!(build.status, BuildSessionStatus::Running);
    assert!(build.nodes.contains_key(&node("sensor-1")));
    assert!(!build.nodes.contains_key(&node("stale")));
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn accepted_assignment_stays_tagged_until_confirmed() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;

    controller
        .assign_port(port("COM3"), node("n1"))
        .await
        .unwrap();

    let deploy = controller.deploy_state().await;
    assert_eq!(deploy.assignments[&port("COM3")], node("n1"));
    assert!(deploy.optimistic_ports.contains(&port("COM3")));
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_assignment_reverts_and_surfaces_a_message() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;
    let mut updates = controller.subscribe();

    let err = controller
        .assign_port(port("COM9"), node("n1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Api(_)));

    let deploy = controller.deploy_state().await;
    assert!(!deploy.assignments.contains_key(&port("COM9")));
    assert!(deploy.optimistic_ports.is_empty());

    let message = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(StateUpdate::RequestRejected(message)) = updates.recv().await {
                break message;
            }
        }
    })
    .await
    .unwrap();
    assert!(message.contains("port busy"));
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn any_rejected_request_surfaces_a_message() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;
    let mut updates = controller.subscribe();

    let err = controller.stop_build().await.unwrap_err();
    assert!(matches!(err, RequestError::Api(_)));

    // The build state is untouched by the rejection.
    let build = controller.build_state().await;
    assert!(build.nodes.is_empty());

    let message = timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(StateUpdate::RequestRejected(message)) = updates.recv().await {
                break message;
            }
        }
    })
    .await
    .unwrap();
    assert!(message.contains("no build running"));
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scan_replaces_devices_and_keeps_assignments() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;

    controller
        .assign_port(port("COM3"), node("n1"))
        .await
        .unwrap();
    let devices = controller.scan_devices().await.unwrap();
    assert_eq!(devices.len(), 2);

    let deploy = controller.deploy_state().await;
    let com3 = deploy
        .devices
        .iter()
        .find(|d| d.port.as_str() == "COM3")
        .unwrap();
    assert_eq!(com3.assigned_node, Some(node("n1")));
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_stages_resynchronizes_from_a_snapshot() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;
    assert_eq!(controller.active_stage().await, Stage::Build);

    controller.set_active_stage(Stage::Deploy).await.unwrap();
    assert_eq!(controller.active_stage().await, Stage::Deploy);
    let deploy = controller.deploy_state().await;
    assert_eq!(deploy.devices.len(), 1);
    assert_eq!(deploy.devices[0].port.as_str(), "COM3");
    controller.close_session().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_session_resets_stage_state() {
    let server_url = spawn_backend().await;
    let controller = open_controller(&server_url).await;

    controller
        .assign_port(port("COM3"), node("n1"))
        .await
        .unwrap();
    controller.close_session().await;

    assert_eq!(controller.session_id().await, None);
    let deploy = controller.deploy_state().await;
    assert!(deploy.assignments.is_empty());
}
