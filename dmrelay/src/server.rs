//! Downstream push server.
//!
//! Subscribers connect over WebSocket, send `joinRoom`/`leaveRoom` commands,
//! and receive normalized events as JSON text frames. Delivery is
//! best-effort: each connection gets a bounded queue and a slow consumer
//! simply loses frames. An optional shared secret gates connections via
//! HTTP Basic auth before the upgrade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use base64::Engine;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use dmrelay_core::{Event, EventSink, RoomId, RoomSupervisor};

/// Outbound queue depth per subscriber connection
const SUBSCRIBER_QUEUE: usize = 256;

/// Commands a subscriber may send over its WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd")]
enum ClientCommand {
    #[serde(rename = "joinRoom")]
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leaveRoom")]
    Leave {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

/// Per-room registry of connected subscribers.
///
/// Implements [`EventSink`]: events are serialized once and pushed to every
/// subscriber of the event's room with `try_send` — a full queue drops the
/// frame for that subscriber only.
#[derive(Default)]
pub struct SubscriberHub {
    rooms: DashMap<RoomId, DashMap<u64, mpsc::Sender<String>>>,
    next_conn_id: AtomicU64,
}

impl SubscriberHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self, room_id: &RoomId, conn_id: u64, tx: mpsc::Sender<String>) {
        self.rooms
            .entry(room_id.clone())
            .or_default()
            .insert(conn_id, tx);
    }

    fn unsubscribe(&self, room_id: &RoomId, conn_id: u64) {
        if let Some(subscribers) = self.rooms.get(room_id) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.rooms.remove_if(room_id, |_, subs| subs.is_empty());
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map(|subs| subs.len()).unwrap_or(0)
    }
}

impl EventSink for SubscriberHub {
    fn deliver(&self, event: Event) {
        let Some(subscribers) = self.rooms.get(&event.room_id) else {
            return;
        };
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id = %event.room_id, "Failed to serialize event: {e}");
                return;
            }
        };
        for entry in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.value().try_send(frame.clone())
            {
                debug!(
                    room_id = %event.room_id,
                    conn_id = entry.key(),
                    "Subscriber queue full, dropping frame"
                );
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SubscriberHub>,
    pub supervisor: RoomSupervisor,
    pub basic_auth: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Validate an `Authorization: Basic` header against the shared secret.
/// The username part is ignored; only the password matters. No configured
/// secret disables the gate.
fn check_basic_auth(authorization: Option<&str>, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(value) = authorization else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let password = credentials
        .split_once(':')
        .map_or(credentials.as_str(), |(_, password)| password);
    password == secret
}

async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if !check_basic_auth(authorization, state.basic_auth.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = state.hub.next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE);

    debug!(conn_id, "Subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Rooms this connection has joined; all are left again on disconnect
    let mut joined: Vec<RoomId> = Vec::new();

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let command = match serde_json::from_str::<ClientCommand>(text.as_str()) {
            Ok(command) => command,
            Err(e) => {
                debug!(conn_id, "Ignoring unrecognized frame: {e}");
                continue;
            }
        };

        match command {
            ClientCommand::Join { room_id } => {
                let room_id = RoomId::from(room_id);
                if joined.contains(&room_id) {
                    continue;
                }
                info!(conn_id, room_id = %room_id, "Subscriber joined room");
                state.hub.subscribe(&room_id, conn_id, tx.clone());
                state.supervisor.join(&room_id).await;
                joined.push(room_id);
            }
            ClientCommand::Leave { room_id } => {
                let room_id = RoomId::from(room_id);
                if let Some(index) = joined.iter().position(|id| *id == room_id) {
                    joined.swap_remove(index);
                    info!(conn_id, room_id = %room_id, "Subscriber left room");
                    state.hub.unsubscribe(&room_id, conn_id);
                    state.supervisor.leave(&room_id).await;
                }
            }
        }
    }

    for room_id in &joined {
        state.hub.unsubscribe(room_id, conn_id);
        state.supervisor.leave(room_id).await;
    }
    send_task.abort();
    debug!(conn_id, "Subscriber disconnected");
}
