//! Small, explicit interfaces at the points where this engine hands off to
//! an external collaborator (the socket transport, a structured logger).
//! Kept deliberately narrow — in practice most logging goes through
//! `tracing` macros directly; these traits exist for the few seams that
//! genuinely need a swappable implementation or a test double.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;

pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Receives events dispatched by the event bus. Implementations should not
/// panic; returning `Err` is logged and does not stop delivery to other
/// subscribers.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, room_or_channel: &str, event_name: &str, payload: Value)
        -> Result<(), EngineError>;
}

/// The bridge from engine events to locally-connected sockets. A seam only —
/// the socket transport itself is out of scope for this crate.
#[async_trait]
pub trait RoomBroadcaster: Send + Sync {
    async fn emit(&self, room: &str, event_name: &str, payload: Value) -> Result<(), EngineError>;
}
