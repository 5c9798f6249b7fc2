//! Hand-rolled session doubles for supervisor tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::models::RoomId;
use crate::router::{EventRouter, EventSink};
use crate::session::{Credentials, DanmakuSession, SessionEvent, SessionFactory, SpawnedSession};

pub(crate) struct MockSession {
    started: AtomicBool,
    stopped: AtomicBool,
    stop_calls: AtomicUsize,
    fail_stop: AtomicBool,
}

impl MockSession {
    fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_calls: AtomicUsize::new(0),
            fail_stop: AtomicBool::new(false),
        }
    }

    pub(crate) fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Flip the session to stopped without going through `stop()`, as a
    /// dropped upstream connection would.
    pub(crate) fn force_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DanmakuSession for MockSession {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Session("stop refused".to_string()));
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Factory double: records every created session and keeps the sender side
/// of each session's event channel so tests can inject signals.
#[derive(Default)]
pub(crate) struct MockFactory {
    fail_create: AtomicBool,
    create_delay_ms: AtomicU64,
    create_calls: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    senders: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
}

impl MockFactory {
    pub(crate) fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_create_delay_ms(&self, delay: u64) {
        self.create_delay_ms.store(delay, Ordering::SeqCst);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.sessions.lock()[index])
    }

    pub(crate) fn sender(&self, index: usize) -> mpsc::Sender<SessionEvent> {
        self.senders.lock()[index].clone()
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create(&self, _room_id: &RoomId, _credentials: &Credentials) -> Result<SpawnedSession> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Session("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::channel(64);
        let session = Arc::new(MockSession::new());
        self.sessions.lock().push(Arc::clone(&session));
        self.senders.lock().push(tx);
        Ok(SpawnedSession {
            session,
            events: rx,
        })
    }
}

struct NullSink;

impl EventSink for NullSink {
    fn deliver(&self, _event: crate::models::Event) {}
}

pub(crate) fn null_router() -> Arc<EventRouter> {
    Arc::new(EventRouter::new(Arc::new(NullSink)))
}
