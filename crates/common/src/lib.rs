//! Shared error taxonomy, integration seams, and event payload types used
//! across every presence-engine crate.

pub mod error;
pub mod events;
pub mod seams;
pub mod time;

pub use error::{EngineError, PreconditionCode};
pub use events::{MetadataEvent, MetadataOperation, PresenceEvent, PresenceEventKind};
pub use seams::{Logger, RoomBroadcaster, Subscriber};
pub use time::now_ms;
