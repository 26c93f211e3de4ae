//! Configuration types for EngineLink
//!
//! Configuration is supplied at construction time and never reloaded.

use crate::error::BridgeError;
use crate::traits::BridgeResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge name for logging
    pub name: String,

    /// Logging level
    pub log_level: String,

    /// State store configuration
    pub store: StoreConfig,

    /// Sync engine configuration
    pub sync: SyncConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "enginelink".to_string(),
            log_level: "info".to_string(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> BridgeResult<Self> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.store.validate()?;
        self.sync.validate()
    }
}

/// Transactional state store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum number of live entries
    pub max_entries: usize,

    /// Maximum number of retained snapshots (all keys combined)
    pub snapshot_capacity: usize,

    /// Reserved; no-op without a persistence collaborator
    pub enable_persistence: bool,

    /// Transaction lifetime in milliseconds
    pub transaction_timeout_ms: u64,

    /// Interval of the expired-transaction sweep in milliseconds
    pub transaction_sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            snapshot_capacity: 100,
            enable_persistence: false,
            transaction_timeout_ms: 30_000,
            transaction_sweep_interval_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn transaction_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.transaction_sweep_interval_ms)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.max_entries == 0 {
            return Err(BridgeError::ConfigError("store.max_entries must be > 0".into()));
        }
        if self.transaction_timeout_ms == 0 || self.transaction_sweep_interval_ms == 0 {
            return Err(BridgeError::ConfigError(
                "store transaction intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Synchronization engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of sync states
    pub max_states: usize,

    /// Periodic snapshot interval in milliseconds
    pub snapshot_interval_ms: u64,

    /// Snapshot time-to-live in milliseconds
    pub snapshot_ttl_ms: u64,

    /// Build delta payloads instead of full documents when possible
    pub enable_delta_compression: bool,

    /// Number of per-version operation batches retained per state
    pub delta_history_limit: usize,

    /// Maximum snapshots retained per state
    pub max_snapshots_per_state: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_states: 1_000,
            snapshot_interval_ms: 60_000,
            snapshot_ttl_ms: 300_000,
            enable_delta_compression: true,
            delta_history_limit: 64,
            max_snapshots_per_state: 10,
        }
    }
}

impl SyncConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.max_states == 0 {
            return Err(BridgeError::ConfigError("sync.max_states must be > 0".into()));
        }
        if self.snapshot_interval_ms == 0 || self.snapshot_ttl_ms == 0 {
            return Err(BridgeError::ConfigError(
                "sync snapshot intervals must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip() {
        let config = BridgeConfig::default();
        let json = config.to_json().unwrap();
        let parsed = BridgeConfig::from_json(&json).unwrap();

        assert_eq!(parsed.store.max_entries, config.store.max_entries);
        assert_eq!(parsed.sync.snapshot_ttl_ms, config.sync.snapshot_ttl_ms);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed = BridgeConfig::from_json(r#"{"store": {"max_entries": 5}}"#).unwrap();

        assert_eq!(parsed.store.max_entries, 5);
        assert_eq!(parsed.store.snapshot_capacity, 100);
        assert!(parsed.sync.enable_delta_compression);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = BridgeConfig::from_json(r#"{"sync": {"max_states": 0}}"#);
        assert!(matches!(result, Err(BridgeError::ConfigError(_))));
    }
}
