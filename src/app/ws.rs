use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::auth::Tenant;
use super::import::ImportReport;
use super::models::*;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum WsMessage {
    LeadCreated {
        lead: Lead,
    },
    LeadUpdated {
        lead: Lead,
    },
    LeadMoved {
        lead: Lead,
        from_status: String,
        to_status: String,
    },
    LeadDeleted {
        lead_id: i64,
    },

    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
    },
    TaskMoved {
        task: Task,
        from_status: TaskStatus,
        to_status: TaskStatus,
    },
    TaskDeleted {
        task_id: i64,
    },

    ServiceOrderCreated {
        service_order: ServiceOrder,
    },
    ServiceOrderUpdated {
        service_order: ServiceOrder,
    },
    ServiceOrderMoved {
        service_order: ServiceOrder,
        from_status: OsStatus,
        to_status: OsStatus,
    },
    ServiceOrderDeleted {
        service_order_id: i64,
    },

    ProjectCreated {
        project: Project,
    },
    ProjectUpdated {
        project: Project,
    },
    ProjectDeleted {
        project_id: i64,
    },

    StagesChanged {
        stages: Vec<Stage>,
    },
    ImportCompleted {
        report: ImportReport,
    },
}

/// A change scoped to one organization, as carried by the broadcast channel
/// and written to sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub organization_id: i64,
    pub event: WsMessage,
}

// ── WebSocket handler ────────────────────────────────────────────────

/// The session is checked before the upgrade handshake is accepted.
pub async fn ws_handler(
    tenant: Tenant,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let org_id = tenant.organization_id();
    tracing::debug!(org_id, user_id = tenant.user.id, "websocket subscribed");
    ws.on_upgrade(move |socket| handle_socket(socket, state, org_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, org_id: i64) {
    let (sender, receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    run_socket_loop(sender, receiver, rx, org_id).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards the tenant's change events, reads client frames, and sends a
/// Ping every [`PING_INTERVAL`]. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping, the connection is considered dead and the
/// loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<ChangeEvent>,
    org_id: i64,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!(org_id, "websocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(change) if change.organization_id == org_id => {
                        let Some(json) = encode(&change) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(org_id, skipped, "websocket client lagged");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

fn encode(change: &ChangeEvent) -> Option<String> {
    match serde_json::to_string(change) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize change event");
            None
        }
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Publish a change to every socket of the organization. Silently does
/// nothing when no client is connected.
pub fn broadcast_message(tx: &broadcast::Sender<ChangeEvent>, org_id: i64, msg: WsMessage) {
    let _ = tx.send(ChangeEvent {
        organization_id: org_id,
        event: msg,
    });
}
