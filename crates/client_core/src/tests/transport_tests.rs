use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    routing::get,
    Router,
};
use shared::envelope::ClientFrame;
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use crate::transport::{websocket_url, Transport};

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
struct WsServerState {
    connections: Arc<AtomicUsize>,
    inbound: mpsc::Sender<String>,
}

async fn ws_handler(
    State(state): State<WsServerState>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsServerState) {
    let connection = state.connections.fetch_add(1, Ordering::SeqCst);
    if connection == 0 {
        // First connection: one frame, then a server-side close.
        let _ = socket
            .send(WsMessage::Text(frame("first").to_string()))
            .await;
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }

    let _ = socket
        .send(WsMessage::Text(frame("second").to_string()))
        .await;
    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let _ = state.inbound.send(text).await;
        }
    }
}

fn frame(node_id: &str) -> serde_json::Value {
    serde_json::json!({
        "stage": "build",
        "type": "node_status",
        "data": {"node_id": node_id, "status": "generating", "iteration": 1, "max_iterations": 3}
    })
}

async fn spawn_ws_server() -> (String, mpsc::Receiver<String>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(16);
    let state = WsServerState {
        connections: Arc::new(AtomicUsize::new(0)),
        inbound: inbound_tx,
    };
    let app = Router::new()
        .route("/ws/:session_id", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), inbound_rx)
}

#[test]
fn websocket_url_swaps_the_scheme() {
    assert_eq!(
        websocket_url("http://localhost:8000", "s1").unwrap(),
        "ws://localhost:8000/ws/s1"
    );
    assert_eq!(
        websocket_url("https://pipeline.example/", "s1").unwrap(),
        "wss://pipeline.example/ws/s1"
    );
    assert!(websocket_url("ftp://nope", "s1").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_a_server_side_close() {
    let (server_url, _server_rx) = spawn_ws_server().await;
    let ws_url = websocket_url(&server_url, "s1").unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let transport = Transport::spawn(ws_url, tx);

    let first = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(first.contains("\"first\""));

    // The second frame only arrives on the second connection, after the
    // fixed reconnect delay.
    let second = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(second.contains("\"second\""));
    assert!(transport.is_connected());
    transport.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_frames_reach_the_server() {
    let (server_url, mut server_rx) = spawn_ws_server().await;
    let ws_url = websocket_url(&server_url, "s1").unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let transport = Transport::spawn(ws_url, tx);

    // Skip to the long-lived second connection.
    let _ = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let _ = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();

    transport.send(ClientFrame::Ping);
    let received = timeout(RECV_TIMEOUT, server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, r#"{"type":"ping"}"#);
    transport.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_sent_while_disconnected_are_not_replayed() {
    let (server_url, mut server_rx) = spawn_ws_server().await;
    let ws_url = websocket_url(&server_url, "s1").unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let transport = Transport::spawn(ws_url, tx);
    let mut watch = transport.connection_watch();

    // Ride out the short-lived first connection.
    let _ = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    timeout(RECV_TIMEOUT, watch.wait_for(|connected| !*connected))
        .await
        .unwrap()
        .unwrap();

    // Keepalives fired into a dead link must not surface later.
    transport.send(ClientFrame::Ping);
    transport.send(ClientFrame::Ping);

    let second = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert!(second.contains("\"second\""));
    transport.send(ClientFrame::Ping);

    let received = timeout(RECV_TIMEOUT, server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, r#"{"type":"ping"}"#);
    // Only the post-reconnect ping reaches the server.
    assert!(timeout(Duration::from_millis(500), server_rx.recv())
        .await
        .is_err());
    transport.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_watch_tracks_the_link() {
    let (server_url, _server_rx) = spawn_ws_server().await;
    let ws_url = websocket_url(&server_url, "s1").unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let transport = Transport::spawn(ws_url, tx);
    let mut watch = transport.connection_watch();

    timeout(RECV_TIMEOUT, watch.wait_for(|connected| *connected))
        .await
        .unwrap()
        .unwrap();

    let _ = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    // First connection is closed by the server.
    timeout(RECV_TIMEOUT, watch.wait_for(|connected| !*connected))
        .await
        .unwrap()
        .unwrap();
    transport.shutdown();
}
