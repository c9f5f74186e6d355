//! Versioned channel-metadata store (spec §4.G): a key-value map per
//! `(channelType, channelName)` with a major revision bumped on every
//! mutation, per-item revisions, optimistic-concurrency CAS, and an
//! optional advisory lock precondition.

mod cas;
mod lock;
mod params;
mod record;
mod store;

pub use cas::{apply_remove, apply_set, apply_update, check_major_revision_cas};
pub use lock::{LockOptions, Locks};
pub use params::{GetParams, ItemPatch, MetadataOptions, RemoveParams, SetParams, UpdateParams};
pub use record::{MetadataEventItemList, MetadataItem, MetadataRecord, MetadataResponse};
pub use store::MetadataStore;
