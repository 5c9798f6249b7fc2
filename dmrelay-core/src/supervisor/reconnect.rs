//! Per-room reconnection engine.
//!
//! Each tracked room is either Idle or Scheduled. Arming is idempotent:
//! session stop signals, session errors, and fleet sweeps all call
//! [`RoomSupervisor::trigger_reconnect`], and at most one retry task exists
//! per room at any time. The retry task sleeps the room's current backoff,
//! re-checks that its room is still tracked (leave cancels the task, and a
//! fired attempt must not install into a room that was removed or replaced
//! meanwhile), then swaps in a fresh session from the factory.
//!
//! Backoff starts at 1s, doubles per consecutive failure, and caps at 60s.
//! Retries repeat while the room stays tracked; cancellation on leave is
//! what bounds them.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{RoomState, RoomSupervisor, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS};
use crate::models::RoomId;

impl RoomSupervisor {
    /// Arm a reconnect for `room_id` unless one is already Scheduled.
    ///
    /// No-op for untracked rooms: there is nothing to reconnect, and a
    /// stray signal for a just-left room must not resurrect it.
    pub fn trigger_reconnect(&self, room_id: &RoomId) {
        let Some(state) = self.state(room_id) else {
            debug!(room_id = %room_id, "Reconnect requested for untracked room, ignoring");
            return;
        };

        if state.retry_pending.swap(true, Ordering::SeqCst) {
            debug!(room_id = %room_id, "Reconnect already scheduled");
            return;
        }

        let supervisor = self.clone();
        let id = room_id.clone();
        let retry_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            retry_loop(supervisor, id, retry_state).await;
        });
        *state.retry_task.lock() = Some(task);
    }
}

async fn retry_loop(supervisor: RoomSupervisor, room_id: RoomId, state: Arc<RoomState>) {
    loop {
        let delay = state.backoff_ms.load(Ordering::SeqCst);
        warn!(room_id = %room_id, delay_ms = delay, "Room disconnected, reconnecting after backoff");
        tokio::time::sleep(Duration::from_millis(delay)).await;

        if !supervisor.owns_state(&room_id, &state) {
            debug!(room_id = %room_id, "Room removed while waiting, abandoning reconnect");
            return;
        }

        // Tear down the stale session first; a stop failure never aborts
        // the attempt.
        state.abort_pump();
        let stale = state.session.read().clone();
        if let Err(e) = stale.stop().await {
            debug!(room_id = %room_id, "Failed to stop stale session: {e}");
        }

        match supervisor.connect(&room_id).await {
            Ok(spawned) => {
                // The room may have been left (or replaced by a fresh join)
                // during the attempt; install-or-abandon.
                if !supervisor.owns_state(&room_id, &state) {
                    debug!(room_id = %room_id, "Room removed during reconnect, discarding session");
                    if let Err(e) = spawned.session.stop().await {
                        debug!(room_id = %room_id, "Failed to stop discarded session: {e}");
                    }
                    return;
                }

                *state.session.write() = spawned.session;
                supervisor.spawn_pump(&room_id, &state, spawned.events);
                state.backoff_ms.store(INITIAL_BACKOFF_MS, Ordering::SeqCst);
                state.retry_pending.store(false, Ordering::SeqCst);
                info!(room_id = %room_id, "Reconnected");
                return;
            }
            Err(e) => {
                let next = delay.saturating_mul(2).min(MAX_BACKOFF_MS);
                state.backoff_ms.store(next, Ordering::SeqCst);
                error!(
                    room_id = %room_id,
                    next_delay_ms = next,
                    "Reconnect failed: {e}"
                );
            }
        }
    }
}
