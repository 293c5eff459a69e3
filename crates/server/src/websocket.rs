//! WebSocket handling

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use cowork_protocol::{ClientMessage, ServerMessage};

use crate::actor::OrchestratorHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_CAPACITY: usize = 256;

/// Frames queued for one client
#[derive(Debug)]
enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(handle): State<OrchestratorHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, handle))
}

/// Orchestrator counters for liveness probes
pub async fn health_handler(State(handle): State<OrchestratorHandle>) -> impl IntoResponse {
    Json(handle.snapshot())
}

async fn handle_socket(socket: WebSocket, handle: OrchestratorHandle) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Every connection observes every event.
    spawn_broadcast_forwarder(handle.subscribe(), outbound_tx.clone(), conn_id);

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        dispatch_text(text.as_str(), &handle, &outbound_tx, conn_id).await;
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Parses one text frame and runs it. Failures are reported to this
/// connection only, as `runner.error`.
async fn dispatch_text(
    text: &str,
    handle: &OrchestratorHandle,
    outbound_tx: &mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) {
    let client_msg = match parse_client_message(text) {
        Ok(msg) => msg,
        Err(reply) => {
            warn!(
                component = "websocket",
                event = "ws.message.parse_failed",
                connection_id = conn_id,
                payload_bytes = text.len(),
                payload_preview = %truncate_for_log(text, 240),
                "Failed to parse client message"
            );
            send_json(outbound_tx, reply).await;
            return;
        }
    };

    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = conn_id,
        command = client_msg.kind(),
        "Client command received"
    );
    if let Err(e) = handle.send(client_msg).await {
        send_json(outbound_tx, e.to_server_message()).await;
    }
}

fn parse_client_message(text: &str) -> Result<ClientMessage, ServerMessage> {
    serde_json::from_str(text).map_err(|e| ServerMessage::RunnerError {
        session_id: None,
        message: format!("Invalid message: {e}"),
    })
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

/// Drains the broadcast into this connection's outbound channel. Exits when
/// the client disconnects, dropping the receiver.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    conn_id: u64,
) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        connection_id = conn_id,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    // Tell the client so it can refetch lists and history.
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::RunnerError {
                            session_id: None,
                            message: format!("Observer lagged, skipped {n} messages"),
                        }))
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
