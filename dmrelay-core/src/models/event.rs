use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RoomId;

/// Kinds of danmaku events the relay recognizes and forwards.
///
/// Every other platform command falls outside this set and is dropped
/// silently by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Ordinary chat message (danmaku)
    Message,
    /// Gift sent to the streamer
    Gift,
    /// Guard (subscription tier) purchase
    GuardPurchase,
    /// Pinned paid message (super chat)
    PaidMessage,
    /// Viewer entered the room
    Enter,
    /// Viewer liked the stream
    Like,
}

impl EventKind {
    /// Map a platform command tag to an event kind.
    ///
    /// Returns `None` for unrecognized tags; callers drop those without
    /// logging.
    #[must_use]
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "DANMU_MSG" => Some(Self::Message),
            "SEND_GIFT" => Some(Self::Gift),
            "GUARD_BUY" => Some(Self::GuardPurchase),
            "SUPER_CHAT_MESSAGE" => Some(Self::PaidMessage),
            "INTERACT_WORD_V2" => Some(Self::Enter),
            "LIKE_CLICK" => Some(Self::Like),
            _ => None,
        }
    }
}

/// Who sent an event. Anonymous senders get uid 0 and a placeholder name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub uid: u64,
    pub username: String,
    pub profile_url: String,
    /// Fan-medal label, e.g. `[粉丝团21]`, when the sender wears one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
}

impl Sender {
    pub const ANONYMOUS_NAME: &'static str = "匿名用户";

    /// Build a sender from possibly-missing platform fields.
    #[must_use]
    pub fn resolve(uid: u64, username: Option<String>, badge: Option<String>) -> Self {
        let username = username
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| Self::ANONYMOUS_NAME.to_string());
        Self {
            uid,
            username,
            profile_url: format!("https://space.bilibili.com/{uid}"),
            badge,
        }
    }
}

/// A normalized danmaku event, never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub sender: Sender,
    pub text: String,
    /// Seconds since epoch, assigned at processing time
    pub timestamp: i64,
    pub room_id: RoomId,
    /// Coin/price value for priced events (gifts, paid messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

/// One opaque platform message as emitted by a session: a command tag plus
/// an unparsed payload. The relay never looks at wire bytes; sessions hand
/// over messages already split into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub command: String,
    #[serde(default)]
    pub payload: Value,
}

impl RawMessage {
    #[must_use]
    pub fn new(command: impl Into<String>, payload: Value) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }
}
