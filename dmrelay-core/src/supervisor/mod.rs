//! Room connection supervision.
//!
//! One upstream session is kept per joined room. Downstream interest is
//! reference-counted: the first join creates the session, later joins share
//! it, and the last leave tears it down. Session failures and the periodic
//! fleet sweep both funnel into the reconnection engine in [`reconnect`].
//!
//! All per-room state lives in a single aggregate record ([`RoomState`]):
//! session slot, subscriber refcount, backoff, and task handles. Keeping
//! these in one entry means a room is either fully tracked or fully gone —
//! there is no cross-table cleanup to get wrong.

mod reconnect;
mod sweep;

#[cfg(test)]
pub(crate) mod testutil;

pub use sweep::FleetScheduler;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::RoomId;
use crate::router::EventRouter;
use crate::session::{Credentials, DanmakuSession, SessionEvent, SessionFactory, SpawnedSession};

pub(crate) const INITIAL_BACKOFF_MS: u64 = 1000;
pub(crate) const MAX_BACKOFF_MS: u64 = 60_000;

/// Aggregate per-room record. Exists iff the room has subscribers or a
/// reconnect in flight for it.
pub(crate) struct RoomState {
    /// Current session; replaced wholesale on reconnect
    pub(crate) session: RwLock<Arc<dyn DanmakuSession>>,
    pub(crate) subscribers: AtomicUsize,
    /// Delay before the next reconnect attempt
    pub(crate) backoff_ms: AtomicU64,
    /// Whether a retry timer is armed; at most one per room
    pub(crate) retry_pending: AtomicBool,
    pub(crate) retry_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomState {
    fn new(session: Arc<dyn DanmakuSession>) -> Self {
        Self {
            session: RwLock::new(session),
            subscribers: AtomicUsize::new(0),
            backoff_ms: AtomicU64::new(INITIAL_BACKOFF_MS),
            retry_pending: AtomicBool::new(false),
            retry_task: Mutex::new(None),
            pump_task: Mutex::new(None),
        }
    }

    /// Cancel the pending retry timer (if armed) and the event pump.
    pub(crate) fn abort_tasks(&self) {
        if let Some(task) = self.retry_task.lock().take() {
            task.abort();
        }
        self.abort_pump();
    }

    pub(crate) fn abort_pump(&self) {
        if let Some(task) = self.pump_task.lock().take() {
            task.abort();
        }
    }
}

struct SupervisorInner {
    rooms: DashMap<RoomId, Arc<RoomState>>,
    /// Per-room creation locks: prevents two concurrent joins from racing a
    /// second session into existence
    creation_locks: DashMap<RoomId, Arc<tokio::sync::Mutex<()>>>,
    factory: Arc<dyn SessionFactory>,
    credentials: Credentials,
    router: Arc<EventRouter>,
}

/// Owns the room map and every session's lifetime.
///
/// Cheaply cloneable handle; the only entry points are `join`, `leave` and
/// `trigger_reconnect` — the maps are never handed out for external
/// mutation.
#[derive(Clone)]
pub struct RoomSupervisor {
    inner: Arc<SupervisorInner>,
}

impl RoomSupervisor {
    #[must_use]
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        credentials: Credentials,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                rooms: DashMap::new(),
                creation_locks: DashMap::new(),
                factory,
                credentials,
                router,
            }),
        }
    }

    /// Register one more downstream subscriber for `room_id`.
    ///
    /// Reuses the existing session when it is healthy; otherwise creates a
    /// fresh one (replacing a dead entry if present). Creation failure is
    /// logged and leaves no partial state — the next join retries from
    /// scratch.
    pub async fn join(&self, room_id: &RoomId) {
        if self.try_join_existing(room_id) {
            return;
        }

        // Slow path under the per-room creation lock, re-checked after
        // acquiring (a concurrent join may have created the session first).
        let lock = self
            .inner
            .creation_locks
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.try_join_existing(room_id) {
            return;
        }

        debug!(room_id = %room_id, "Creating session");
        match self.connect(room_id).await {
            Ok(spawned) => {
                self.install(room_id, spawned, 1).await;
                info!(room_id = %room_id, "Joined room");
            }
            Err(e) => {
                error!(room_id = %room_id, "Failed to create session: {e}");
                if !self.inner.rooms.contains_key(room_id) {
                    self.inner.creation_locks.remove(room_id);
                }
            }
        }
    }

    /// Healthy-entry fast path: increment and return true if a live session
    /// already exists for the room.
    fn try_join_existing(&self, room_id: &RoomId) -> bool {
        let Some(state) = self.state(room_id) else {
            return false;
        };
        let session = state.session.read().clone();
        if !session.is_started() || session.is_stopped() {
            return false;
        }
        let count = state.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(room_id = %room_id, subscribers = count, "Reusing existing session");
        true
    }

    /// Deregister one subscriber. Unknown rooms are a no-op. When the last
    /// subscriber leaves, the session is stopped, the entry removed, and any
    /// pending reconnect cancelled. Stop failures are logged, never
    /// surfaced.
    pub async fn leave(&self, room_id: &RoomId) {
        let Some(state) = self.state(room_id) else {
            return;
        };

        let previous = state
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        debug!(room_id = %room_id, subscribers = remaining, "Subscriber left");

        if remaining > 0 {
            return;
        }

        if let Some((_, state)) = self.inner.rooms.remove(room_id) {
            state.abort_tasks();
            self.inner.creation_locks.remove(room_id);
            let session = state.session.read().clone();
            if let Err(e) = session.stop().await {
                warn!(room_id = %room_id, "Failed to stop session: {e}");
            }
            info!(room_id = %room_id, "Room no longer used, closed");
        }
    }

    /// Whether the room has a tracked, started-and-not-stopped session.
    #[must_use]
    pub fn is_healthy(&self, room_id: &RoomId) -> bool {
        self.state(room_id)
            .map(|state| {
                let session = state.session.read().clone();
                session.is_started() && !session.is_stopped()
            })
            .unwrap_or(false)
    }

    /// Current subscriber count for a room (0 when untracked).
    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.state(room_id)
            .map(|state| state.subscribers.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Snapshot of all currently-tracked room ids.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stop every session and drop all rooms. Used on process shutdown.
    pub async fn shutdown(&self) {
        for room_id in self.room_ids() {
            if let Some((_, state)) = self.inner.rooms.remove(&room_id) {
                state.abort_tasks();
                let session = state.session.read().clone();
                if let Err(e) = session.stop().await {
                    debug!(room_id = %room_id, "Failed to stop session on shutdown: {e}");
                }
            }
        }
        self.inner.creation_locks.clear();
    }

    /// Create and start a fresh session for a room.
    pub(crate) async fn connect(&self, room_id: &RoomId) -> Result<SpawnedSession> {
        let spawned = self
            .inner
            .factory
            .create(room_id, &self.inner.credentials)
            .await?;
        spawned.session.start().await?;
        Ok(spawned)
    }

    /// Insert a fresh RoomState for a just-created session, tearing down a
    /// dead previous entry if one exists.
    pub(crate) async fn install(&self, room_id: &RoomId, spawned: SpawnedSession, subscribers: usize) {
        let state = Arc::new(RoomState::new(spawned.session));
        state.subscribers.store(subscribers, Ordering::SeqCst);

        if let Some((_, dead)) = self.inner.rooms.remove(room_id) {
            dead.abort_tasks();
            let stale = dead.session.read().clone();
            if let Err(e) = stale.stop().await {
                debug!(room_id = %room_id, "Failed to stop stale session: {e}");
            }
        }

        self.inner.rooms.insert(room_id.clone(), Arc::clone(&state));
        self.spawn_pump(room_id, &state, spawned.events);
    }

    /// Identity check used by in-flight reconnect attempts: true while
    /// `state` is still the tracked record for the room.
    pub(crate) fn owns_state(&self, room_id: &RoomId, state: &Arc<RoomState>) -> bool {
        self.inner
            .rooms
            .get(room_id)
            .map(|current| Arc::ptr_eq(current.value(), state))
            .unwrap_or(false)
    }

    pub(crate) fn state(&self, room_id: &RoomId) -> Option<Arc<RoomState>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    pub(crate) fn spawn_pump(
        &self,
        room_id: &RoomId,
        state: &Arc<RoomState>,
        events: mpsc::Receiver<SessionEvent>,
    ) {
        let supervisor = self.clone();
        let id = room_id.clone();
        let task = tokio::spawn(async move {
            pump_events(supervisor, id, events).await;
        });
        *state.pump_task.lock() = Some(task);
    }
}

/// Forward a session's event stream: raw messages go to the router,
/// stop/error signals arm the reconnection engine. Exits when the session's
/// sender side is dropped.
async fn pump_events(
    supervisor: RoomSupervisor,
    room_id: RoomId,
    mut events: mpsc::Receiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Started => {
                debug!(room_id = %room_id, "Session started");
            }
            SessionEvent::Message(raw) => {
                supervisor.router().process(&room_id, raw);
            }
            SessionEvent::Stopped => {
                debug!(room_id = %room_id, "Session stopped");
                supervisor.trigger_reconnect(&room_id);
            }
            SessionEvent::Error(e) => {
                warn!(room_id = %room_id, "Session error: {e}");
                supervisor.trigger_reconnect(&room_id);
            }
        }
    }
}
