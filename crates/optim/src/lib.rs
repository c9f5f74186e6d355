//! Optimization Layer (spec §4.H): three accelerators interchangeable with
//! the default presence/metadata paths — a heartbeat batcher, a scripted
//! (single-round-trip) heartbeat, and a scripted join. The metadata CAS
//! wrapper's transactional variant lives in `pulsemesh-metadata::store`
//! directly rather than here, since it shares that crate's `read_record`/
//! `write_record` plumbing; see DESIGN.md.

mod batcher;
mod scripts;

pub use batcher::HeartbeatBatcher;
pub use scripts::{ScriptedHeartbeatOutcome, ScriptedOps};
