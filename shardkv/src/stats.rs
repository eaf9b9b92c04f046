use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{MigrationStatus, PutStatus};

/// Counters shared by the foreground API and the background services.
#[derive(Debug, Default)]
pub struct StoreStats {
    puts_succeeded: AtomicU64,
    puts_queued: AtomicU64,
    puts_rejected: AtomicU64,
    puts_failed: AtomicU64,
    retries_succeeded: AtomicU64,
    retries_requeued: AtomicU64,
    dead_lettered: AtomicU64,
    reaped: AtomicU64,
    reaper_skipped: AtomicU64,
    purged_rows: AtomicU64,
    maintenance_failures: AtomicU64,
    replications: AtomicU64,
    replication_failures: AtomicU64,
    migrations_succeeded: AtomicU64,
    migrations_not_found: AtomicU64,
    migrations_aborted: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub puts_succeeded: u64,
    pub puts_queued: u64,
    pub puts_rejected: u64,
    pub puts_failed: u64,
    pub retries_succeeded: u64,
    pub retries_requeued: u64,
    pub dead_lettered: u64,
    pub reaped: u64,
    pub reaper_skipped: u64,
    pub purged_rows: u64,
    pub maintenance_failures: u64,
    pub replications: u64,
    pub replication_failures: u64,
    pub migrations_succeeded: u64,
    pub migrations_not_found: u64,
    pub migrations_aborted: u64,
}

#[inline]
fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl StoreStats {
    pub(crate) fn record_put(&self, status: PutStatus) {
        let counter = match status {
            PutStatus::Success => &self.puts_succeeded,
            PutStatus::Queued => &self.puts_queued,
            PutStatus::Rejected => &self.puts_rejected,
            PutStatus::Fail => &self.puts_failed,
        };
        bump(counter, 1);
    }

    pub(crate) fn record_migration(&self, status: MigrationStatus) {
        let counter = match status {
            MigrationStatus::Success => &self.migrations_succeeded,
            MigrationStatus::NotFound => &self.migrations_not_found,
            MigrationStatus::Aborted => &self.migrations_aborted,
        };
        bump(counter, 1);
    }

    pub(crate) fn retry_succeeded(&self) {
        bump(&self.retries_succeeded, 1);
    }

    pub(crate) fn retry_requeued(&self) {
        bump(&self.retries_requeued, 1);
    }

    pub(crate) fn dead_lettered(&self) {
        bump(&self.dead_lettered, 1);
    }

    pub(crate) fn reaped(&self, n: u64) {
        bump(&self.reaped, n);
    }

    pub(crate) fn reaper_skipped(&self, n: u64) {
        bump(&self.reaper_skipped, n);
    }

    pub(crate) fn purged(&self, n: u64) {
        bump(&self.purged_rows, n);
    }

    pub(crate) fn maintenance_failed(&self) {
        bump(&self.maintenance_failures, 1);
    }

    pub(crate) fn replicated(&self) {
        bump(&self.replications, 1);
    }

    pub(crate) fn replication_failed(&self) {
        bump(&self.replication_failures, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            puts_succeeded: get(&self.puts_succeeded),
            puts_queued: get(&self.puts_queued),
            puts_rejected: get(&self.puts_rejected),
            puts_failed: get(&self.puts_failed),
            retries_succeeded: get(&self.retries_succeeded),
            retries_requeued: get(&self.retries_requeued),
            dead_lettered: get(&self.dead_lettered),
            reaped: get(&self.reaped),
            reaper_skipped: get(&self.reaper_skipped),
            purged_rows: get(&self.purged_rows),
            maintenance_failures: get(&self.maintenance_failures),
            replications: get(&self.replications),
            replication_failures: get(&self.replication_failures),
            migrations_succeeded: get(&self.migrations_succeeded),
            migrations_not_found: get(&self.migrations_not_found),
            migrations_aborted: get(&self.migrations_aborted),
        }
    }
}
