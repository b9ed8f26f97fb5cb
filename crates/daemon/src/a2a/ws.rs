//! WebSocket notification stream
//!
//! Server->client JSON-RPC notifications (`port.statusChanged`,
//! `agent.evicted`, heartbeats) flow over `/a2a/ws`. Browsers cannot set
//! headers on a WebSocket handshake, so authentication rides in query
//! parameters. Lagging clients drop messages and are told how many.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::a2a::{netguard, A2aContext};
use crate::audit::{EventCategory, SecurityEvent, Severity};

#[derive(Debug, Deserialize)]
pub struct WsAuth {
    pub token: String,
    #[serde(rename = "agentId")]
    pub agent_id: Uuid,
}

/// Upgrade handler for the notification stream.
pub async fn events_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<A2aContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(auth): Query<WsAuth>,
) -> Response {
    if !netguard::is_private(&peer.ip()) {
        ctx.audit.append(
            SecurityEvent::new(
                Severity::Warning,
                EventCategory::Network,
                "network.rfc1918_violation",
                75,
            )
            .with_source(peer.to_string()),
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    if ctx.tokens.validate(&auth.token, &auth.agent_id).await.is_err() {
        ctx.audit.append(
            SecurityEvent::new(
                Severity::Warning,
                EventCategory::Authentication,
                "auth.failed",
                60,
            )
            .with_agent(auth.agent_id)
            .with_source(peer.to_string()),
        );
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let agent_id = auth.agent_id;
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, agent_id))
}

/// Stream notifications until either side closes.
async fn handle_socket(mut socket: WebSocket, ctx: Arc<A2aContext>, agent_id: Uuid) {
    info!(agent = %agent_id, "notification stream connected");

    let mut rx = ctx.notifications.subscribe();
    let mut dropped_count: usize = 0;

    loop {
        tokio::select! {
            notification = rx.recv() => {
                match notification {
                    Ok(notification) => {
                        if dropped_count > 0 {
                            let backpressure = serde_json::json!({
                                "jsonrpc": "2.0",
                                "method": "stream.backpressure",
                                "params": { "droppedCount": dropped_count },
                            });
                            if let Ok(text) = serde_json::to_string(&backpressure) {
                                let _ = socket.send(Message::Text(text)).await;
                            }
                            dropped_count = 0;
                        }
                        match serde_json::to_string(&notification) {
                            Ok(text) => {
                                if let Err(e) = socket.send(Message::Text(text)).await {
                                    error!(agent = %agent_id, "send failed: {}", e);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to serialize notification: {}", e);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        dropped_count += n as usize;
                        debug!(agent = %agent_id, dropped = n, "client lagging");
                    }
                    Err(_) => break,
                }
            }

            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(agent = %agent_id, "client closed stream");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Keepalives only; clients do not send requests here.
                    }
                    Some(Err(e)) => {
                        error!(agent = %agent_id, "stream error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    info!(agent = %agent_id, "notification stream disconnected");
}
