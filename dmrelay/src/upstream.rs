//! Upstream gateway sessions.
//!
//! Each session is a WebSocket client to a danmaku gateway endpoint that
//! emits one JSON frame per platform message (`{"cmd": ..., "data": ...}`).
//! The platform's own wire protocol (binary framing, handshake,
//! decompression) lives behind the gateway; this side only splits frames
//! into command tag + payload and forwards them as session events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, warn};
use url::Url;

use dmrelay_core::{
    Credentials, DanmakuSession, Error, RawMessage, Result, RoomId, SessionEvent, SessionFactory,
    SpawnedSession,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_QUEUE: usize = 256;

/// One JSON frame from the gateway.
#[derive(Debug, Deserialize)]
struct GatewayFrame {
    cmd: String,
    #[serde(default)]
    data: Value,
}

/// Builds gateway sessions from a URL template containing `{room_id}`.
pub struct GatewaySessionFactory {
    gateway_url: String,
}

impl GatewaySessionFactory {
    #[must_use]
    pub fn new(gateway_url: String) -> Self {
        Self { gateway_url }
    }
}

#[async_trait]
impl SessionFactory for GatewaySessionFactory {
    async fn create(&self, room_id: &RoomId, credentials: &Credentials) -> Result<SpawnedSession> {
        let url = feed_url(&self.gateway_url, room_id, credentials)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let session = Arc::new(GatewaySession {
            room_id: room_id.clone(),
            url,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events_tx,
            reader_task: Mutex::new(None),
        });
        Ok(SpawnedSession {
            session,
            events: events_rx,
        })
    }
}

/// Substitute the room id into the URL template and attach credentials as
/// query parameters.
fn feed_url(template: &str, room_id: &RoomId, credentials: &Credentials) -> Result<Url> {
    let substituted = template.replace("{room_id}", room_id.as_str());
    let mut url = Url::parse(&substituted)
        .map_err(|e| Error::InvalidInput(format!("Invalid gateway URL {substituted:?}: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(Error::InvalidInput(format!(
                "Unsupported gateway URL scheme {other:?}, expected ws or wss"
            )));
        }
    }

    url.query_pairs_mut()
        .append_pair("transport", credentials.transport.as_str());
    if !credentials.sess_data.is_empty() {
        url.query_pairs_mut()
            .append_pair("sess_data", &credentials.sess_data);
    }
    Ok(url)
}

pub struct GatewaySession {
    room_id: RoomId,
    url: Url,
    started: AtomicBool,
    stopped: AtomicBool,
    events_tx: mpsc::Sender<SessionEvent>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl DanmakuSession for GatewaySession {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                self.stopped.store(true, Ordering::SeqCst);
                Error::Session(format!(
                    "Connection to gateway timed out after {CONNECT_TIMEOUT:?}"
                ))
            })?
            .map_err(|e| {
                self.stopped.store(true, Ordering::SeqCst);
                Error::Session(format!("Failed to connect to gateway: {e}"))
            })?;

        let (stream, _response) = connected;
        let _ = self.events_tx.send(SessionEvent::Started).await;

        let events = self.events_tx.clone();
        let room_id = self.room_id.clone();
        let task = tokio::spawn(async move {
            read_frames(room_id, stream, events).await;
        });
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the stream closes the connection; the reader is aborted
        // first so the deliberate stop emits no Stopped signal.
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

async fn read_frames<S>(
    room_id: RoomId,
    mut stream: S,
    events: mpsc::Sender<SessionEvent>,
) where
    S: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(tungstenite::Message::Text(text)) => {
                let frame = match serde_json::from_str::<GatewayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(room_id = %room_id, "Ignoring malformed gateway frame: {e}");
                        continue;
                    }
                };
                let raw = RawMessage::new(frame.cmd, frame.data);
                if events.send(SessionEvent::Message(raw)).await.is_err() {
                    // Receiver gone; the session is being torn down
                    return;
                }
            }
            Ok(tungstenite::Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(room_id = %room_id, "Gateway read error: {e}");
                let _ = events.send(SessionEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    let _ = events.send(SessionEvent::Stopped).await;
}
