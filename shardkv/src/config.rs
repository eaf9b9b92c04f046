use std::{path::PathBuf, time::Duration};

use envconfig::Envconfig;

use crate::{
    error::{StoreError, StoreResult},
    ShardId,
};

#[derive(Envconfig, Clone, Debug)]
pub struct StoreConfig {
    /// Comma separated shard ids.
    #[envconfig(from = "SHARDKV_SHARDS", default = "s1,s2,s3")]
    pub shards: String,
    #[envconfig(from = "SHARDKV_DATA_DIR", default = "./data")]
    pub data_dir: String,
    #[envconfig(from = "SHARDKV_STANDBY_DIR")]
    pub standby_dir: Option<String>,
    #[envconfig(from = "SHARDKV_VNODES", default = "3")]
    pub virtual_nodes_per_shard: usize,
    #[envconfig(from = "SHARDKV_MAX_LOCKS", default = "1000")]
    pub max_locks: usize,
    #[envconfig(from = "SHARDKV_MAX_QUEUE_SIZE", default = "5000")]
    pub max_queue_size: usize,
    #[envconfig(from = "SHARDKV_MAX_RETRY_ATTEMPTS", default = "5")]
    pub max_retry_attempts: u32,
    #[envconfig(from = "SHARDKV_DEAD_LETTER_CAPACITY", default = "1024")]
    pub dead_letter_capacity: usize,
    #[envconfig(from = "SHARDKV_RESCHEDULE_WORKERS", default = "4")]
    pub reschedule_workers: usize,
    #[envconfig(from = "SHARDKV_LOCK_TIMEOUT_MS", default = "2000")]
    pub lock_timeout_ms: u64,
    #[envconfig(from = "SHARDKV_POOL_SIZE", default = "5")]
    pub connection_pool_size: u64,
    #[envconfig(from = "SHARDKV_POOL_TIMEOUT_MS", default = "2000")]
    pub pool_timeout_ms: u64,
    #[envconfig(from = "SHARDKV_HOT_TTL_SECS", default = "60")]
    pub hot_ttl_secs: u64,
    #[envconfig(from = "SHARDKV_DURABLE_TTL_SECS", default = "604800")]
    pub durable_ttl_secs: u64,
    #[envconfig(from = "SHARDKV_REAPER_INTERVAL_MS", default = "10000")]
    pub reaper_interval_ms: u64,
    #[envconfig(from = "SHARDKV_RESCHEDULE_INTERVAL_MS", default = "5000")]
    pub reschedule_interval_ms: u64,
    #[envconfig(from = "SHARDKV_REPLICATION_INTERVAL_SECS", default = "600")]
    pub replication_interval_secs: u64,
    #[envconfig(from = "SHARDKV_MAINTENANCE_INTERVAL_SECS", default = "3600")]
    pub maintenance_interval_secs: u64,
    /// 0 disables the telemetry log.
    #[envconfig(from = "SHARDKV_TELEMETRY_INTERVAL_SECS", default = "30")]
    pub telemetry_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shards: "s1,s2,s3".into(),
            data_dir: "./data".into(),
            standby_dir: None,
            virtual_nodes_per_shard: 3,
            max_locks: 1000,
            max_queue_size: 5000,
            max_retry_attempts: 5,
            dead_letter_capacity: 1024,
            reschedule_workers: 4,
            lock_timeout_ms: 2000,
            connection_pool_size: 5,
            pool_timeout_ms: 2000,
            hot_ttl_secs: 60,
            durable_ttl_secs: 7 * 24 * 3600,
            reaper_interval_ms: 10_000,
            reschedule_interval_ms: 5000,
            replication_interval_secs: 600,
            maintenance_interval_secs: 3600,
            telemetry_interval_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn with_shards<I, S>(mut self, shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list: Vec<String> =
            shards.into_iter().map(|s| s.as_ref().to_string()).collect();
        self.shards = list.join(",");
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into().to_string_lossy().into_owned();
        self
    }

    pub fn shard_list(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self
            .shards
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        shards.sort();
        shards.dedup();
        shards
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn standby_path(&self) -> PathBuf {
        self.standby_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_path())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn hot_ttl(&self) -> Duration {
        Duration::from_secs(self.hot_ttl_secs)
    }

    pub fn durable_ttl(&self) -> Duration {
        Duration::from_secs(self.durable_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn reschedule_interval(&self) -> Duration {
        Duration::from_millis(self.reschedule_interval_ms)
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_secs(self.replication_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn telemetry_interval(&self) -> Option<Duration> {
        (self.telemetry_interval_secs > 0)
            .then(|| Duration::from_secs(self.telemetry_interval_secs))
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.shard_list().is_empty() {
            return Err(StoreError::NoShards);
        }
        let positive = [
            ("SHARDKV_VNODES", self.virtual_nodes_per_shard as u64),
            ("SHARDKV_MAX_LOCKS", self.max_locks as u64),
            ("SHARDKV_MAX_QUEUE_SIZE", self.max_queue_size as u64),
            ("SHARDKV_MAX_RETRY_ATTEMPTS", self.max_retry_attempts as u64),
            ("SHARDKV_RESCHEDULE_WORKERS", self.reschedule_workers as u64),
            ("SHARDKV_LOCK_TIMEOUT_MS", self.lock_timeout_ms),
            ("SHARDKV_POOL_SIZE", self.connection_pool_size),
            ("SHARDKV_POOL_TIMEOUT_MS", self.pool_timeout_ms),
            ("SHARDKV_REAPER_INTERVAL_MS", self.reaper_interval_ms),
            ("SHARDKV_RESCHEDULE_INTERVAL_MS", self.reschedule_interval_ms),
            ("SHARDKV_REPLICATION_INTERVAL_SECS", self.replication_interval_secs),
            ("SHARDKV_MAINTENANCE_INTERVAL_SECS", self.maintenance_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StoreError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}
