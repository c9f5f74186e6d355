//! Config schema types: store connection, TTLs, reaper cadence, and the
//! optimization-layer feature flags.

use serde::{Deserialize, Serialize};

/// Root engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,

    /// Connection record TTL, in milliseconds. Heartbeats and joins renew it.
    pub connection_ttl_ms: u64,

    pub reaper: ReaperConfig,
    pub heartbeat_batcher: BatcherConfig,

    /// Use the single-round-trip scripted heartbeat instead of read-then-write.
    pub scripted_heartbeat_enabled: bool,

    /// Use the single-round-trip scripted join instead of read-then-write.
    pub scripted_join_enabled: bool,

    pub transactional_metadata: TransactionalMetadataConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            connection_ttl_ms: 30_000,
            reaper: ReaperConfig::default(),
            heartbeat_batcher: BatcherConfig::default(),
            scripted_heartbeat_enabled: false,
            scripted_join_enabled: false,
            transactional_metadata: TransactionalMetadataConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Apply individual environment-variable overrides on top of whatever
    /// was loaded from a file (or the defaults). Mirrors the handful of
    /// fields operators commonly tune per-deployment without a config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PULSEMESH_STORE_URL") {
            self.store.url = url;
        }
        if let Ok(prefix) = std::env::var("PULSEMESH_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        if let Some(ttl) = env_u64("PULSEMESH_CONNECTION_TTL_MS") {
            self.connection_ttl_ms = ttl;
        }
        if let Some(interval) = env_u64("PULSEMESH_REAPER_INTERVAL_MS") {
            self.reaper.interval_ms = interval;
        }
    }

    /// Reaper lookback, in milliseconds: explicit config value, or 2x the
    /// connection TTL when unset.
    pub fn reaper_lookback_ms(&self) -> u64 {
        self.reaper.lookback_ms.unwrap_or(self.connection_ttl_ms * 2)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "prs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub interval_ms: u64,
    /// Defaults to `2 * connection_ttl_ms` when unset; see `EngineConfig::reaper_lookback_ms`.
    pub lookback_ms: Option<u64>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            lookback_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_batch_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 50,
            max_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionalMetadataConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for TransactionalMetadataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 5,
            retry_delay_ms: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lookback_is_2x_ttl() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.reaper_lookback_ms(), cfg.connection_ttl_ms * 2);
    }

    #[test]
    fn explicit_lookback_overrides_default() {
        let mut cfg = EngineConfig::default();
        cfg.reaper.lookback_ms = Some(123);
        assert_eq!(cfg.reaper_lookback_ms(), 123);
    }
}
