//! Periodic fleet-wide reconnect sweep.
//!
//! Long-lived upstream sessions can go silently stale without ever
//! signalling stop or error. On each tick of the configured cron schedule,
//! every room tracked at that instant gets a reconnect trigger,
//! unconditionally; the trigger's idempotence makes this safe for rooms
//! that are already Scheduled. Rooms joined after a tick's snapshot wait
//! for the next tick.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::RoomSupervisor;
use crate::error::{Error, Result};

pub struct FleetScheduler {
    expression: String,
    schedule: Schedule,
    supervisor: RoomSupervisor,
}

impl FleetScheduler {
    /// Parse a cron expression (seconds field included, e.g.
    /// `0 0 3 * * *` for 03:00 daily). Fails fast on an invalid expression.
    pub fn new(expression: &str, supervisor: RoomSupervisor) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|source| Error::Schedule {
            expression: expression.to_string(),
            source,
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            supervisor,
        })
    }

    /// Build from the optional config value; absent means sweeps are
    /// disabled.
    pub fn from_config(
        expression: Option<&str>,
        supervisor: RoomSupervisor,
    ) -> Result<Option<Self>> {
        expression
            .map(|expr| Self::new(expr, supervisor))
            .transpose()
    }

    /// Run the sweep loop as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(schedule = %self.expression, "Fleet reconnect sweep scheduled");
        tokio::spawn(async move {
            loop {
                let Some(next) = self.schedule.upcoming(Utc).next() else {
                    info!(schedule = %self.expression, "Schedule has no further occurrences");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                self.supervisor.sweep_once();
            }
        })
    }
}

impl RoomSupervisor {
    /// Trigger a reconnect evaluation for every room tracked right now.
    pub fn sweep_once(&self) {
        let rooms = self.room_ids();
        debug!(rooms = rooms.len(), "Running fleet reconnect sweep");
        for room_id in &rooms {
            self.trigger_reconnect(room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{null_router, MockFactory};
    use super::*;
    use crate::models::RoomId;
    use crate::session::{Credentials, SessionFactory};

    fn supervisor(factory: &Arc<MockFactory>) -> RoomSupervisor {
        RoomSupervisor::new(
            Arc::clone(factory) as Arc<dyn SessionFactory>,
            Credentials::anonymous(),
            null_router(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_triggers_every_tracked_room() {
        let factory = MockFactory::arc();
        let sup = supervisor(&factory);
        let a = RoomId::from("10");
        let b = RoomId::from("20");

        sup.join(&a).await;
        sup.join(&b).await;
        sup.sweep_once();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        // Two initial creates plus one forced refresh each
        assert_eq!(factory.create_calls(), 4);
        assert!(sup.is_healthy(&a));
        assert!(sup.is_healthy(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_joined_after_snapshot_not_swept() {
        let factory = MockFactory::arc();
        let sup = supervisor(&factory);
        let a = RoomId::from("10");
        let c = RoomId::from("30");

        sup.join(&a).await;
        sup.sweep_once();
        sup.join(&c).await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        // a: join + sweep refresh; c: join only
        assert_eq!(factory.create_calls(), 3);
        let state = sup.state(&c).expect("tracked");
        assert!(!state.retry_pending.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalid_cron_expression_rejected() {
        let factory = MockFactory::arc();
        let sup = supervisor(&factory);

        let result = FleetScheduler::new("not a cron", sup);
        assert!(matches!(result, Err(Error::Schedule { .. })));
    }

    #[tokio::test]
    async fn test_absent_expression_disables_sweeps() {
        let factory = MockFactory::arc();
        let sup = supervisor(&factory);

        let scheduler = FleetScheduler::from_config(None, sup.clone()).unwrap();
        assert!(scheduler.is_none());

        let scheduler = FleetScheduler::from_config(Some("0 0 3 * * *"), sup).unwrap();
        assert!(scheduler.is_some());
    }
}
