use std::collections::HashMap;

/// Options shared by `set`/`update`/`remove`. `major_revision` is the
/// caller's expected current `majorRevision`; `None` skips that CAS check
/// (mirrors the distilled spec's `options.majorRevision >= 0` gate, modeled
/// here as `Option` instead of a sentinel negative number).
#[derive(Debug, Clone, Default)]
pub struct MetadataOptions {
    pub major_revision: Option<u64>,
    pub lock_name: Option<String>,
    pub add_timestamp: bool,
    pub add_user_id: bool,
}

/// A single targeted item for `update`, carrying its own optional
/// per-item revision CAS.
#[derive(Debug, Clone)]
pub struct ItemPatch {
    pub value: String,
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SetParams {
    pub channel_type: String,
    pub channel_name: String,
    pub data: HashMap<String, String>,
    pub options: MetadataOptions,
    pub actor_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateParams {
    pub channel_type: String,
    pub channel_name: String,
    pub data: HashMap<String, ItemPatch>,
    pub options: MetadataOptions,
    pub actor_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoveParams {
    pub channel_type: String,
    pub channel_name: String,
    pub keys: Option<Vec<String>>,
    pub options: MetadataOptions,
    pub actor_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GetParams {
    pub channel_type: String,
    pub channel_name: String,
}
