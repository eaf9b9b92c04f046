use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    buffer::HotBuffer,
    lock::{LockId, LockRegistry},
    stats::StoreStats,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    /// Expired keys left alone because a write held their lock.
    pub skipped: usize,
}

/// Background sweep removing hot-buffer entries older than the TTL.
///
/// Each expired key is purged only while holding its own lock, taken without
/// waiting. A key that is being written is skipped until the next cycle.
pub struct ExpiryReaper {
    buffer: Arc<HotBuffer>,
    locks: LockRegistry,
    stats: Arc<StoreStats>,
    ttl: Duration,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(
        buffer: Arc<HotBuffer>,
        locks: LockRegistry,
        stats: Arc<StoreStats>,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            locks,
            stats,
            ttl,
            interval,
        }
    }

    /// Runs one cycle.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        for key in self.buffer.expired_keys(now, self.ttl) {
            let id = LockId::Key(key.clone());
            let Some(guard) = self.locks.try_acquire(id.clone()) else {
                report.skipped += 1;
                continue;
            };
            // re-checked under the lock: a write may have refreshed the entry
            if self.buffer.remove_expired(&key, now, self.ttl) {
                debug!("reaped expired key {}", key);
                report.reaped += 1;
            }
            drop(guard);
            self.locks.discard_idle(&id);
        }
        self.stats.reaped(report.reaped as u64);
        self.stats.reaper_skipped(report.skipped as u64);
        report
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "start expiry reaper: ttl {:?}, every {:?}",
                self.ttl, self.interval
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        let report = self.sweep();
                        if report.reaped > 0 || report.skipped > 0 {
                            debug!(
                                "reaper cycle: {} reaped, {} skipped",
                                report.reaped, report.skipped
                            );
                        }
                    }
                    _ = token.cancelled() => {
                        info!("cancelled expiry reaper");
                        break;
                    }
                }
            }
        })
    }
}
