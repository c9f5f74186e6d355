//! Connection Registry and Room Index: the durable per-connection record
//! and the set/sorted-set indexes that derive room membership from it.

pub mod connection;
pub mod room;

pub use connection::{ConnectionRecord, ConnectionRegistry};
pub use room::{ConnMeta, RoomIndex};
