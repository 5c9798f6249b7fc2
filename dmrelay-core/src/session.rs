//! Upstream session abstraction.
//!
//! A [`DanmakuSession`] is one connection to one room's live chat feed. The
//! wire protocol (framing, handshake, decompression) is fully encapsulated
//! behind implementations of this trait; the relay core only sees
//! [`SessionEvent`] values on the channel a [`SessionFactory`] hands back
//! alongside the session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::Result;
use crate::models::{RawMessage, RoomId};

/// Signals emitted by a running session.
///
/// `Error` does not imply `Stopped`; the supervisor decides whether either
/// warrants a reconnect.
#[derive(Debug)]
pub enum SessionEvent {
    Started,
    Stopped,
    Error(String),
    Message(RawMessage),
}

/// One upstream connection carrying a single room's event stream.
///
/// `start` and `stop` are idempotent. Status flags are monotonic for one
/// session instance: once stopped, a session is never restarted — the
/// supervisor replaces it with a fresh one from the factory.
#[async_trait]
pub trait DanmakuSession: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_started(&self) -> bool;
    fn is_stopped(&self) -> bool;
}

/// A freshly-created session together with its event stream.
pub struct SpawnedSession {
    pub session: Arc<dyn DanmakuSession>,
    pub events: mpsc::Receiver<SessionEvent>,
}

/// Constructs sessions for rooms. Pure factory, no shared state between
/// created sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, room_id: &RoomId, credentials: &Credentials) -> Result<SpawnedSession>;
}

/// Upstream transport selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Ws,
    Tcp,
}

impl Transport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Tcp => "tcp",
        }
    }

    /// Parse a configured transport string, defaulting unknown values to
    /// `ws` (with a log line) rather than failing startup.
    #[must_use]
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "ws" => Self::Ws,
            "tcp" => Self::Tcp,
            other => {
                info!(
                    transport = other,
                    "Unknown upstream transport, falling back to ws"
                );
                Self::Ws
            }
        }
    }
}

/// Platform authentication material, supplied once at startup and passed
/// unchanged into every `create` call.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Platform session cookie; empty means anonymous (user info may be
    /// limited upstream)
    pub sess_data: String,
    pub transport: Transport,
}

impl Credentials {
    #[must_use]
    pub fn new(sess_data: String, transport: Transport) -> Self {
        Self {
            sess_data,
            transport,
        }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            sess_data: String::new(),
            transport: Transport::Ws,
        }
    }
}
