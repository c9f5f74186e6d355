//! Event Bus: publishes presence and channel-metadata events on per-room
//! pub/sub channels, and fans incoming events out to in-process subscribers.

mod bus;

pub use bus::{Disposer, EventBus};
