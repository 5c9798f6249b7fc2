pub mod event;
pub mod id;

pub use event::{Event, EventKind, RawMessage, Sender};
pub use id::RoomId;
