//! Configuration schema and discovery for the presence engine.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use loader::{
    clear_config_dir, config_dir, data_dir, discover_and_load, find_or_default_config_path,
    load_config, load_config_value, save_config, set_config_dir, update_config,
};
pub use schema::{BatcherConfig, EngineConfig, ReaperConfig, StoreConfig, TransactionalMetadataConfig};
