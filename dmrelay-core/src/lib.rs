// dmrelay-core - Room connection supervision for danmaku relays
//
// Architecture:
// - models/     - Identifiers and the normalized event record
// - session     - Upstream session abstraction (factory + event stream)
// - supervisor/ - Room registry, reconnection engine, fleet sweep
// - router      - Raw message filtering and normalization
//
// One upstream session is kept per joined room; downstream subscriber
// interest is reference-counted onto it.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod router;
pub mod session;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};
pub use models::{Event, EventKind, RawMessage, RoomId, Sender};
pub use router::{EventRouter, EventSink};
pub use session::{Credentials, DanmakuSession, SessionEvent, SessionFactory, SpawnedSession, Transport};
pub use supervisor::{FleetScheduler, RoomSupervisor};
