//! Raw message filtering and normalization.
//!
//! The router sits between a room's session and the downstream sink. Raw
//! platform messages are matched against an allow-list of recognized kinds,
//! normalized into [`Event`] records, and handed to the sink one at a time.
//! Anything unrecognized is dropped without a log line — high-volume noise
//! commands are expected, not errors.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::{Event, EventKind, RawMessage, RoomId, Sender};

/// Downstream delivery seam. Implementations push to currently-subscribed
/// consumers of `event.room_id`, best-effort: no acknowledgement, no retry,
/// and `deliver` must never block the caller.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: Event);
}

/// All kinds the relay recognizes, in platform command order.
pub const DEFAULT_ALLOWED_KINDS: [EventKind; 6] = [
    EventKind::Message,
    EventKind::Gift,
    EventKind::GuardPurchase,
    EventKind::PaidMessage,
    EventKind::Enter,
    EventKind::Like,
];

pub struct EventRouter {
    allowed: Vec<EventKind>,
    sink: Arc<dyn EventSink>,
}

impl EventRouter {
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_allowed_kinds(sink, DEFAULT_ALLOWED_KINDS.to_vec())
    }

    #[must_use]
    pub fn with_allowed_kinds(sink: Arc<dyn EventSink>, allowed: Vec<EventKind>) -> Self {
        Self { allowed, sink }
    }

    /// Process one raw platform message for `room_id`.
    ///
    /// A processing failure is logged and isolated; it never affects
    /// subsequent messages.
    pub fn process(&self, room_id: &RoomId, raw: RawMessage) {
        let Some(kind) = EventKind::from_command(&raw.command) else {
            return;
        };
        if !self.allowed.contains(&kind) {
            return;
        }

        match normalize(kind, room_id, raw.payload) {
            Ok(Some(event)) => self.sink.deliver(event),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    room_id = %room_id,
                    command = %raw.command,
                    "Failed to process message: {e}"
                );
            }
        }
    }
}

// Per-kind payload shapes. Fields default so partially-filled platform
// messages normalize instead of erroring; only type mismatches fail.

#[derive(Debug, Deserialize, Default)]
struct Medal {
    #[serde(default)]
    name: String,
    #[serde(default)]
    level: u32,
}

impl Medal {
    fn badge(&self) -> Option<String> {
        (self.level > 0).then(|| format!("[{}{}]", self.name, self.level))
    }
}

#[derive(Debug, Deserialize, Default)]
struct FansMedal {
    #[serde(default)]
    medal_name: String,
    #[serde(default)]
    medal_level: u32,
}

impl FansMedal {
    fn badge(&self) -> Option<String> {
        (self.medal_level > 0).then(|| format!("[{}{}]", self.medal_name, self.medal_level))
    }
}

#[derive(Debug, Deserialize)]
struct DanmakuPayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    uname: Option<String>,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    medal: Option<Medal>,
}

#[derive(Debug, Deserialize)]
struct GiftPayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    uname: Option<String>,
    #[serde(rename = "giftName", default)]
    gift_name: String,
    #[serde(default)]
    num: u64,
    #[serde(rename = "coinType", default)]
    coin_type: String,
    #[serde(rename = "totalCoin", default)]
    total_coin: u64,
}

#[derive(Debug, Deserialize)]
struct GuardPayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    username: Option<String>,
    #[serde(rename = "guardLevel", default)]
    guard_level: u32,
}

#[derive(Debug, Deserialize)]
struct PaidMessagePayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    uname: Option<String>,
    #[serde(default)]
    price: u64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct InteractPayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    uname: Option<String>,
    #[serde(rename = "msgType", default)]
    msg_type: u32,
    #[serde(default)]
    fans_medal: Option<FansMedal>,
}

#[derive(Debug, Deserialize)]
struct LikePayload {
    #[serde(default)]
    uid: u64,
    #[serde(default)]
    uname: Option<String>,
    #[serde(default)]
    fans_medal: Option<FansMedal>,
}

/// Guard tier display names, indexed by platform guard level.
fn guard_tier_name(level: u32) -> &'static str {
    match level {
        1 => "总督",
        2 => "提督",
        3 => "舰长",
        _ => "舰长",
    }
}

/// The interact-word sub-type that represents an actual room entry. Other
/// sub-types (follow, share, ...) of the same command family produce no
/// output.
const INTERACT_ENTER: u32 = 1;

fn normalize(kind: EventKind, room_id: &RoomId, payload: Value) -> Result<Option<Event>> {
    let timestamp = Utc::now().timestamp();
    let make = |sender: Sender, text: String, amount: Option<u64>| Event {
        kind,
        sender,
        text,
        timestamp,
        room_id: room_id.clone(),
        amount,
    };

    let event = match kind {
        EventKind::Message => {
            let p: DanmakuPayload = parse(payload)?;
            let badge = p.medal.as_ref().and_then(Medal::badge);
            Some(make(Sender::resolve(p.uid, p.uname, badge), p.msg, None))
        }
        EventKind::Gift => {
            let p: GiftPayload = parse(payload)?;
            let coin = if p.coin_type == "gold" {
                "金瓜子"
            } else {
                "银瓜子"
            };
            let text = format!("赠送 {}x{} ({}x{})", p.gift_name, p.num, coin, p.total_coin);
            Some(make(
                Sender::resolve(p.uid, p.uname, None),
                text,
                Some(p.total_coin),
            ))
        }
        EventKind::GuardPurchase => {
            let p: GuardPayload = parse(payload)?;
            let text = format!("开通了 {}", guard_tier_name(p.guard_level));
            Some(make(Sender::resolve(p.uid, p.username, None), text, None))
        }
        EventKind::PaidMessage => {
            let p: PaidMessagePayload = parse(payload)?;
            let text = format!("醒目留言 ￥{}: {}", p.price, p.message);
            Some(make(
                Sender::resolve(p.uid, p.uname, None),
                text,
                Some(p.price),
            ))
        }
        EventKind::Enter => {
            let p: InteractPayload = parse(payload)?;
            if p.msg_type != INTERACT_ENTER {
                return Ok(None);
            }
            let badge = p.fans_medal.as_ref().and_then(FansMedal::badge);
            Some(make(
                Sender::resolve(p.uid, p.uname, badge),
                "进入直播间".to_string(),
                None,
            ))
        }
        EventKind::Like => {
            let p: LikePayload = parse(payload)?;
            let badge = p.fans_medal.as_ref().and_then(FansMedal::badge);
            Some(make(
                Sender::resolve(p.uid, p.uname, badge),
                "为主播点赞了".to_string(),
                None,
            ))
        }
    };

    Ok(event)
}

fn parse<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(Error::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<Event>>,
    }

    impl EventSink for CollectingSink {
        fn deliver(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    fn router() -> (EventRouter, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (EventRouter::new(sink.clone()), sink)
    }

    fn room() -> RoomId {
        RoomId::from("100")
    }

    #[test]
    fn test_danmaku_message() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "DANMU_MSG",
                json!({"uid": 7, "uname": "viewer", "msg": "hello",
                       "medal": {"name": "团团", "level": 3}}),
            ),
        );

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Message);
        assert_eq!(events[0].text, "hello");
        assert_eq!(events[0].sender.uid, 7);
        assert_eq!(events[0].sender.badge.as_deref(), Some("[团团3]"));
        assert!(events[0].amount.is_none());
    }

    #[test]
    fn test_anonymous_defaults() {
        let (router, sink) = router();
        router.process(&room(), RawMessage::new("DANMU_MSG", json!({"msg": "hi"})));

        let events = sink.events.lock();
        assert_eq!(events[0].sender.uid, 0);
        assert_eq!(events[0].sender.username, Sender::ANONYMOUS_NAME);
        assert_eq!(
            events[0].sender.profile_url,
            "https://space.bilibili.com/0"
        );
    }

    #[test]
    fn test_gift_text_and_amount() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "SEND_GIFT",
                json!({"uid": 1, "uname": "fan", "giftName": "小花花",
                       "num": 10, "coinType": "gold", "totalCoin": 1000}),
            ),
        );

        let events = sink.events.lock();
        assert_eq!(events[0].text, "赠送 小花花x10 (金瓜子x1000)");
        assert_eq!(events[0].amount, Some(1000));
    }

    #[test]
    fn test_gift_silver_coin() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "SEND_GIFT",
                json!({"giftName": "辣条", "num": 1, "coinType": "silver", "totalCoin": 100}),
            ),
        );

        assert_eq!(sink.events.lock()[0].text, "赠送 辣条x1 (银瓜子x100)");
    }

    #[test]
    fn test_guard_purchase_tiers() {
        let (router, sink) = router();
        for (level, tier) in [(1, "总督"), (2, "提督"), (3, "舰长")] {
            router.process(
                &room(),
                RawMessage::new(
                    "GUARD_BUY",
                    json!({"uid": 5, "username": "captain", "guardLevel": level}),
                ),
            );
            assert_eq!(
                sink.events.lock().last().unwrap().text,
                format!("开通了 {tier}")
            );
        }
    }

    #[test]
    fn test_paid_message() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "SUPER_CHAT_MESSAGE",
                json!({"uid": 9, "uname": "rich", "price": 30, "message": "加油"}),
            ),
        );

        let events = sink.events.lock();
        assert_eq!(events[0].kind, EventKind::PaidMessage);
        assert_eq!(events[0].text, "醒目留言 ￥30: 加油");
        assert_eq!(events[0].amount, Some(30));
    }

    #[test]
    fn test_enter_only_for_entry_subtype() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "INTERACT_WORD_V2",
                json!({"uid": 3, "uname": "guest", "msgType": 1}),
            ),
        );
        // Sub-type 2 (follow) must not surface
        router.process(
            &room(),
            RawMessage::new(
                "INTERACT_WORD_V2",
                json!({"uid": 3, "uname": "guest", "msgType": 2}),
            ),
        );

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Enter);
        assert_eq!(events[0].text, "进入直播间");
    }

    #[test]
    fn test_like_with_fan_medal() {
        let (router, sink) = router();
        router.process(
            &room(),
            RawMessage::new(
                "LIKE_CLICK",
                json!({"uid": 4, "uname": "fan",
                       "fans_medal": {"medal_name": "粉丝团", "medal_level": 21}}),
            ),
        );

        let events = sink.events.lock();
        assert_eq!(events[0].text, "为主播点赞了");
        assert_eq!(events[0].sender.badge.as_deref(), Some("[粉丝团21]"));
    }

    #[test]
    fn test_disallowed_kind_dropped() {
        let sink = Arc::new(CollectingSink::default());
        let router =
            EventRouter::with_allowed_kinds(sink.clone(), vec![EventKind::Message]);

        router.process(
            &room(),
            RawMessage::new("SEND_GIFT", json!({"giftName": "花", "num": 1})),
        );
        router.process(&room(), RawMessage::new("DANMU_MSG", json!({"msg": "kept"})));

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "kept");
    }

    #[test]
    fn test_unknown_command_dropped_silently() {
        let (router, sink) = router();
        router.process(&room(), RawMessage::new("NOTICE_MSG", json!({"msg": "sys"})));
        router.process(&room(), RawMessage::new("HEARTBEAT", json!(30)));
        assert!(sink.events.lock().is_empty());
    }

    #[test]
    fn test_malformed_payload_isolated() {
        let (router, sink) = router();
        // uid as a string is a type mismatch; processing must not panic and
        // must not affect the next message
        router.process(
            &room(),
            RawMessage::new("DANMU_MSG", json!({"uid": "not-a-number", "msg": "bad"})),
        );
        router.process(&room(), RawMessage::new("DANMU_MSG", json!({"msg": "good"})));

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "good");
    }
}
