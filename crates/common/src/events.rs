use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A presence event published on a room's presence pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    #[serde(rename = "type")]
    pub kind: PresenceEventKind,
    pub room_id: String,
    pub user_id: String,
    pub conn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    pub ts_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Join,
    Update,
    Leave,
}

/// A metadata mutation event published on a channel's metadata pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEvent {
    pub channel_type: String,
    pub channel_name: String,
    pub operation: MetadataOperation,
    pub items: Vec<MetadataEventItem>,
    pub major_revision: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_uid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataOperation {
    Set,
    Update,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEventItem {
    pub key: String,
    pub value: String,
    pub revision: u64,
}
