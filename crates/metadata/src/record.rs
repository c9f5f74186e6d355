use std::collections::BTreeMap;

use pulsemesh_common::MetadataEventItem;
use serde::{Deserialize, Serialize};

/// The list of touched-item summaries a mutation reports for event
/// publication; aliased here purely to keep `cas.rs`/`store.rs` signatures
/// readable.
pub type MetadataEventItemList = Vec<MetadataEventItem>;

/// A single key's value within a metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataItem {
    pub value: String,
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_iso: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_uid: Option<String>,
}

/// The versioned key-value map for one `(channelType, channelName)`.
///
/// Ordered by key (`BTreeMap`) purely for deterministic test assertions and
/// JSON round-tripping; the store itself has no notion of key order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataRecord {
    pub items: BTreeMap<String, MetadataItem>,
    pub major_revision: u64,
}

impl MetadataRecord {
    pub fn total_count(&self) -> usize {
        self.items.len()
    }
}

/// The shape returned by every metadata operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub timestamp: u64,
    pub channel_type: String,
    pub channel_name: String,
    pub total_count: usize,
    pub major_revision: u64,
    pub metadata: BTreeMap<String, MetadataItem>,
}

impl MetadataResponse {
    pub fn from_record(channel_type: &str, channel_name: &str, record: &MetadataRecord, timestamp: u64) -> Self {
        Self {
            timestamp,
            channel_type: channel_type.to_string(),
            channel_name: channel_name.to_string(),
            total_count: record.total_count(),
            major_revision: record.major_revision,
            metadata: record.items.clone(),
        }
    }
}
