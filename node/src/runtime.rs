//! Bridge runtime owning the store and the sync engine

use enginelink_core::{BridgeConfig, BridgeResult};
use enginelink_state::{create_state_store, SharedStateStore, StoreStats};
use enginelink_sync::{create_sync_engine, SharedSyncEngine, SyncStats};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Combined component statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub store: StoreStats,
    pub sync: SyncStats,
}

/// Explicitly owned store and engine, handed to collaborators by reference
pub struct BridgeRuntime {
    config: BridgeConfig,
    store: SharedStateStore,
    engine: SharedSyncEngine,
}

impl BridgeRuntime {
    /// Create a runtime from a validated configuration
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;

        let store = create_state_store(config.store.clone());
        let engine = create_sync_engine(config.sync.clone());

        Ok(Self {
            config,
            store,
            engine,
        })
    }

    /// Start background tasks of both components; idempotent
    pub fn start(&self) -> BridgeResult<()> {
        self.store.start()?;
        if let Err(e) = self.engine.start() {
            warn!("Sync engine failed to start: {}", e);
            self.store.stop();
            return Err(e);
        }

        info!("Runtime '{}' started", self.config.name);
        Ok(())
    }

    /// Cancel all background tasks; idempotent
    pub fn stop(&self) {
        self.engine.stop();
        self.store.stop();
        info!("Runtime '{}' stopped", self.config.name);
    }

    pub fn is_running(&self) -> bool {
        self.store.is_running() && self.engine.is_running()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            store: self.store.get_stats(),
            sync: self.engine.get_stats(),
        }
    }

    /// Get store reference
    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// Get engine reference
    pub fn engine(&self) -> &SharedSyncEngine {
        &self.engine
    }

    /// Get config reference
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginelink_core::{BridgeError, StoreConfig};
    use serde_json::json;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = BridgeConfig {
            store: StoreConfig {
                max_entries: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        assert!(matches!(
            BridgeRuntime::new(config),
            Err(BridgeError::ConfigError(_))
        ));
    }

    #[test]
    fn test_independent_runtimes() {
        let a = BridgeRuntime::new(BridgeConfig::default()).unwrap();
        let b = BridgeRuntime::new(BridgeConfig::default()).unwrap();

        a.store().set("k", json!(1), None).unwrap();
        a.engine().create_state("arena", json!({})).unwrap();

        assert!(!b.store().has("k"));
        assert_eq!(a.stats().store.entry_count, 1);
        assert_eq!(a.stats().sync.state_count, 1);
        assert_eq!(b.stats().sync.state_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_lifecycle() {
        let runtime = BridgeRuntime::new(BridgeConfig::default()).unwrap();

        runtime.start().unwrap();
        runtime.start().unwrap();
        assert!(runtime.is_running());

        runtime.stop();
        runtime.stop();
        assert!(!runtime.is_running());
    }

    #[test]
    fn test_start_outside_runtime_leaves_nothing_running() {
        let runtime = BridgeRuntime::new(BridgeConfig::default()).unwrap();

        assert!(matches!(runtime.start(), Err(BridgeError::SchedulerUnavailable)));
        assert!(!runtime.store().is_running());
    }
}
