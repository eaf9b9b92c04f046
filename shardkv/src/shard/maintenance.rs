use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{now_millis, ShardStore};
use crate::{
    error::StoreResult,
    lock::{LockId, LockRegistry},
    stats::StoreStats,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged: usize,
    pub compacted: bool,
}

/// Long-horizon TTL purge and compaction of one shard's durable tier.
///
/// Separate from the hot-buffer reaper: this one works on rows in SQLite
/// with a TTL measured in days.
pub struct ShardMaintenance {
    shard: Arc<ShardStore>,
    locks: LockRegistry,
    stats: Arc<StoreStats>,
    ttl: Duration,
    interval: Duration,
    lock_timeout: Duration,
}

impl ShardMaintenance {
    pub fn new(
        shard: Arc<ShardStore>,
        locks: LockRegistry,
        stats: Arc<StoreStats>,
        ttl: Duration,
        interval: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            shard,
            locks,
            stats,
            ttl,
            interval,
            lock_timeout,
        }
    }

    /// Purges expired rows and compacts while holding the shard's sector
    /// lock exclusively. The whole cycle is skipped if the sector stays busy
    /// for longer than the lock timeout.
    pub async fn run_once(&self) -> StoreResult<MaintenanceReport> {
        let sector = LockId::Sector(self.shard.id().clone());
        let _fence = match self.locks.acquire(sector, self.lock_timeout).await {
            Ok(fence) => fence,
            Err(err) => {
                debug!(
                    "shard {}: skip maintenance this cycle: {}",
                    self.shard.id(),
                    err
                );
                return Ok(MaintenanceReport::default());
            }
        };
        let cutoff = now_millis() - self.ttl.as_millis() as i64;
        let purged = self.shard.purge_older_than(cutoff).await?;
        self.stats.purged(purged as u64);
        self.shard.compact().await?;
        Ok(MaintenanceReport {
            purged,
            compacted: true,
        })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let token = self.shard.token().clone();
        tokio::spawn(async move {
            info!(
                "shard {}: start maintenance every {:?}",
                self.shard.id(),
                self.interval
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        match self.run_once().await {
                            Ok(report) => info!(
                                "shard {}: maintenance purged {} rows, compacted: {}",
                                self.shard.id(), report.purged, report.compacted
                            ),
                            Err(err) => {
                                self.stats.maintenance_failed();
                                error!(
                                    "shard {}: maintenance failed: {}",
                                    self.shard.id(), err
                                );
                            }
                        }
                    }
                    _ = token.cancelled() => {
                        info!("shard {}: cancelled maintenance", self.shard.id());
                        break;
                    }
                }
            }
        })
    }
}
