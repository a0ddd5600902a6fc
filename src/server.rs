//! Wire server (C1): WebSocket upgrade + `GET /health`, both on one port.
//!
//! Each accepted socket is split into a receive loop (this module) and a
//! send task fed by an unbounded mpsc channel; [`ConnectionHandle`] wraps
//! the sender half so the rest of the Hub can push frames without touching
//! the socket directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::AuthValidator;
use crate::connection::{ConnId, ConnectionHandle};
use crate::hub::Hub;
use crate::messages::{methods, RawMessage, RegistrationParams, codes};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct ServerState {
    hub: Arc<Hub>,
    auth: Arc<AuthValidator>,
}

pub fn router(hub: Arc<Hub>, auth: Arc<AuthValidator>) -> Router {
    let state = ServerState { hub, auth };
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.hub.health().await)
}

async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: ServerState) {
    let conn_id: ConnId = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = ConnectionHandle::new(conn_id, tx);

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut registered = false;

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let raw: RawMessage = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(conn_id, error = %e, "dropping non-JSON-RPC frame");
                continue;
            }
        };

        if !registered {
            if raw.method != methods::REGISTRATION {
                warn!(conn_id, method = %raw.method, "first frame must be registration");
                continue;
            }
            match serde_json::from_value::<RegistrationParams>(raw.params.clone()) {
                Ok(params) => {
                    if !state.auth.validate(params.auth_token.as_deref()) {
                        warn!(conn_id, "registration rejected: bad auth token");
                        let _ = handle.close(codes::AUTH_REJECTED as u16, "unauthorized");
                        break;
                    }
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "malformed registration params");
                    continue;
                }
            }
            registered = true;
        }

        debug!(conn_id, method = %raw.method, "recv");
        state.hub.dispatch(conn_id, &handle, raw).await;
    }

    info!(conn_id, "connection closed");
    state.hub.on_disconnect(conn_id).await;
    send_task.abort();
}
