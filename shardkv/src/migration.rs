//! Moving a single key between two shards.
//!
//! The two shards are independent SQLite files, so there is no transaction
//! spanning both. The move is prepare-then-commit: read the source row,
//! write it to the destination, then delete it from the source. If the
//! destination write fails the source is untouched. If the source delete
//! fails after the destination write, the key exists in both shards, and
//! the source stays authoritative until [`MigrationCoordinator::reconcile`]
//! finishes the move.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    error::MigrationStatus,
    lock::{LockGuard, LockId, LockRegistry},
    shard::{ShardStore, StoredRow},
    ShardId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Prepare,
    Commit,
    Done,
    Aborted,
}

/// In-memory description of one in-flight move. Never persisted.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub key: String,
    pub from: ShardId,
    pub to: ShardId,
    pub phase: MigrationPhase,
}

impl MigrationRecord {
    fn new(key: &str, from: &ShardStore, to: &ShardStore) -> Self {
        Self {
            key: key.to_string(),
            from: from.id().clone(),
            to: to.id().clone(),
            phase: MigrationPhase::Prepare,
        }
    }

    fn advance(&mut self, phase: MigrationPhase) {
        debug!(
            "migration of {} ({} -> {}): {:?} -> {:?}",
            self.key, self.from, self.to, self.phase, phase
        );
        self.phase = phase;
    }
}

pub struct MigrationCoordinator {
    locks: LockRegistry,
    lock_timeout: Duration,
}

impl MigrationCoordinator {
    pub fn new(locks: LockRegistry, lock_timeout: Duration) -> Self {
        Self {
            locks,
            lock_timeout,
        }
    }

    /// Takes both sectors shared (in id order) and the key exclusively, for
    /// the whole move.
    async fn lock(
        &self,
        key: &str,
        from: &ShardStore,
        to: &ShardStore,
    ) -> Option<Vec<LockGuard>> {
        let mut sectors = [from.id(), to.id()];
        sectors.sort();
        let mut guards = Vec::with_capacity(3);
        for sector in sectors {
            let id = LockId::Sector(sector.clone());
            match self.locks.acquire_shared(id, self.lock_timeout).await {
                Ok(guard) => guards.push(guard),
                Err(err) => {
                    warn!("migration of {} not started: {}", key, err);
                    return None;
                }
            }
        }
        let id = LockId::Key(key.to_string());
        match self.locks.acquire(id, self.lock_timeout).await {
            Ok(guard) => guards.push(guard),
            Err(err) => {
                warn!("migration of {} not started: {}", key, err);
                return None;
            }
        }
        Some(guards)
    }

    /// Moves `key` from `from` to `to`.
    pub async fn migrate(
        &self,
        key: &str,
        from: &Arc<ShardStore>,
        to: &Arc<ShardStore>,
    ) -> MigrationStatus {
        let Some(_guards) = self.lock(key, from, to).await else {
            return MigrationStatus::Aborted;
        };
        let mut record = MigrationRecord::new(key, from, to);
        let row = match from.get_row(key).await {
            Ok(Some(row)) => row,
            Ok(None) => return MigrationStatus::NotFound,
            Err(err) => {
                record.advance(MigrationPhase::Aborted);
                warn!("migration of {} aborted while preparing: {}", key, err);
                return MigrationStatus::Aborted;
            }
        };
        self.commit(&mut record, row, from, to).await
    }

    /// Repairs a key left behind by an aborted migration. Idempotent:
    /// - in both shards: the source copy is written over the destination
    ///   and then deleted from the source
    /// - only in the destination: already moved
    /// - only in the source: moved now
    pub async fn reconcile(
        &self,
        key: &str,
        from: &Arc<ShardStore>,
        to: &Arc<ShardStore>,
    ) -> MigrationStatus {
        let Some(_guards) = self.lock(key, from, to).await else {
            return MigrationStatus::Aborted;
        };
        let mut record = MigrationRecord::new(key, from, to);
        let (source, dest) = match (from.get_row(key).await, to.get_row(key).await) {
            (Ok(source), Ok(dest)) => (source, dest),
            (Err(err), _) | (_, Err(err)) => {
                record.advance(MigrationPhase::Aborted);
                warn!("reconcile of {} aborted while preparing: {}", key, err);
                return MigrationStatus::Aborted;
            }
        };
        match (source, dest) {
            (Some(row), _) => self.commit(&mut record, row, from, to).await,
            (None, Some(_)) => {
                record.advance(MigrationPhase::Done);
                MigrationStatus::Success
            }
            (None, None) => MigrationStatus::NotFound,
        }
    }

    async fn commit(
        &self,
        record: &mut MigrationRecord,
        row: StoredRow,
        from: &ShardStore,
        to: &ShardStore,
    ) -> MigrationStatus {
        record.advance(MigrationPhase::Commit);
        if let Err(err) = to.put_row(&record.key, &row).await {
            record.advance(MigrationPhase::Aborted);
            warn!(
                "migration of {} aborted, {} keeps the only copy: {}",
                record.key, record.from, err
            );
            return MigrationStatus::Aborted;
        }
        if let Err(err) = from.delete(&record.key).await {
            record.advance(MigrationPhase::Aborted);
            warn!(
                "migration of {} aborted after writing {}, key exists in both shards until reconciled: {}",
                record.key, record.to, err
            );
            return MigrationStatus::Aborted;
        }
        record.advance(MigrationPhase::Done);
        info!("migrated {} from {} to {}", record.key, record.from, record.to);
        MigrationStatus::Success
    }
}
