//! A sharded key-value store with per-key locking, bounded retry queueing,
//! consistent-hash routing, cross-shard key migration and periodic standby
//! replication. Each shard is a SQLite file behind a `mobc` pool.

pub mod buffer;
pub mod config;
pub mod error;
pub mod lock;
pub mod migration;
pub mod reaper;
pub mod replication;
pub mod retry;
pub mod ring;
pub mod shard;
pub mod stats;
mod store;

pub use config::StoreConfig;
pub use error::{DeleteStatus, MigrationStatus, PutStatus, StoreError, StoreResult};
pub use lock::{LockGuard, LockId, LockRegistry};
pub use ring::ShardRing;
pub use stats::StatsSnapshot;
pub use store::{RebalanceReport, ShardedStore};

pub type ShardId = String;
