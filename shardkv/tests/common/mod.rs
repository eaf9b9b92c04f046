use std::{sync::Arc, time::Duration};

use shardkv::{ShardedStore, StoreConfig};
use tempfile::TempDir;

/// Store configuration tuned for tests: short timeouts, fast background
/// loops and no telemetry log.
pub fn test_config(dir: &TempDir, shards: &[&str]) -> StoreConfig {
    let mut config = StoreConfig::default()
        .with_shards(shards)
        .with_data_dir(dir.path());
    config.standby_dir = Some(dir.path().join("standby").to_string_lossy().into_owned());
    config.lock_timeout_ms = 100;
    config.pool_timeout_ms = 500;
    config.reschedule_interval_ms = 200;
    config.telemetry_interval_secs = 0;
    config
}

/// A store living in its own temporary directory.
pub struct TestEnvironment {
    pub dir: TempDir,
    pub store: Arc<ShardedStore>,
}

impl TestEnvironment {
    pub fn new(shards: &[&str]) -> Self {
        Self::with_config(shards, |_| {})
    }

    pub fn with_config(shards: &[&str], tweak: impl FnOnce(&mut StoreConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = test_config(&dir, shards);
        tweak(&mut config);
        let store = ShardedStore::open(config).expect("open store");
        Self { dir, store }
    }

    /// Closes the store and opens a fresh one over the same files.
    #[allow(dead_code)]
    pub async fn reopen(self) -> Self {
        let config = self.store.config().clone();
        self.store.close().await;
        let store = ShardedStore::open(config).expect("reopen store");
        Self { dir: self.dir, store }
    }
}

/// Polls `cond` every 20ms until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}
