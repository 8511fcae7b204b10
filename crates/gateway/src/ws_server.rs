//! WebSocket server handler using Axum.
//!
//! Each socket gets a bounded outbound channel and a client id. Frames are
//! parsed here, at the boundary; only well-formed messages reach the gateway.

use crate::client::ClientId;
use crate::protocol::{parse_client_messages, ServerMessage};
use crate::service::GatewayHandle;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keepalive ping period.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared application state.
pub struct AppState {
    pub gateway: GatewayHandle,
    /// Outbound buffer per client, in messages.
    pub client_channel_buffer: usize,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gateway.stats().await {
        Ok(stats) => {
            let upstream = stats
                .upstream
                .and_then(|s| serde_json::to_string(&s).ok())
                .unwrap_or_else(|| "null".to_string());
            (
                StatusCode::OK,
                format!(
                    r#"{{"status":"ok","upstream":{},"clients":{},"subscriptions":{},"pendingFetches":{},"baskets":{}}}"#,
                    upstream, stats.clients, stats.subscriptions, stats.pending_fetches, stats.baskets
                ),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!(r#"{{"status":"unavailable","error":{}}}"#, serde_json::json!(e.to_string())),
        ),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.client_channel_buffer);
    let client_id: ClientId = Uuid::new_v4();

    if let Err(e) = state.gateway.connect_client(client_id, tx.clone()).await {
        warn!("Rejecting client {}: {}", client_id, e);
        return;
    }
    info!("Client {} connected", client_id);

    // Forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if !handle_message(&state, client_id, &tx, msg).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if tx.is_closed() {
                    break;
                }
                let _ = tx.try_send(Message::Ping(Vec::new().into()));
            }
        }
    }

    if let Err(e) = state.gateway.disconnect_client(client_id).await {
        debug!("Gateway gone while disconnecting {}: {}", client_id, e);
    }
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected", client_id);
}

/// Handle one frame. Returns false when the gateway is gone.
async fn handle_message(
    state: &AppState,
    client_id: ClientId,
    tx: &mpsc::Sender<Message>,
    msg: Message,
) -> bool {
    let frame = match msg {
        Message::Text(text) => text.as_str().to_owned(),
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                reply_error(tx, "binary frame is not UTF-8");
                return true;
            }
        },
        // axum answers pings itself
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => return true,
    };

    for parsed in parse_client_messages(&frame) {
        match parsed {
            Ok(message) => {
                debug!("Client {} sent {:?}", client_id, message);
                if state.gateway.client_message(client_id, message).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                counter!("gateway_malformed_messages_total").increment(1);
                reply_error(tx, e);
            }
        }
    }
    true
}

fn reply_error(tx: &mpsc::Sender<Message>, message: impl Into<String>) {
    match serde_json::to_string(&ServerMessage::error(message)) {
        Ok(json) => {
            let _ = tx.try_send(Message::Text(json.into()));
        }
        Err(e) => warn!("Failed to serialize error reply: {}", e),
    }
}
