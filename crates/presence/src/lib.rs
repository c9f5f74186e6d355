//! Presence Service (spec §4.D): join/heartbeat/leave/snapshot with the
//! ordering and epoch-fencing rules that make the engine safe for a
//! reconnecting client to race its own stale socket.

mod epoch;
mod service;

pub use epoch::{EpochDecision, decide_heartbeat_epoch, next_join_epoch};
pub use service::{
    JoinResult, LeftConnection, PresenceService, SnapshotEntry, is_empty_patch, merge_state,
};
