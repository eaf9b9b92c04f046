use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    buffer::HotBuffer,
    config::StoreConfig,
    error::{DeleteStatus, MigrationStatus, PutStatus, StoreError, StoreResult},
    lock::{LockGuard, LockId, LockRegistry},
    migration::MigrationCoordinator,
    reaper::ExpiryReaper,
    replication::ReplicationService,
    retry::{DeadLetters, RetryQueue, RetryTarget, RetryTask, Rescheduler},
    ring::ShardRing,
    shard::{MaintenanceReport, ShardMaintenance, ShardStore},
    stats::{StatsSnapshot, StoreStats},
    ShardId,
};

/// Outcome of moving keys after a membership change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub scanned: usize,
    pub moved: usize,
    /// Keys deleted between the scan and their migration.
    pub missing: usize,
    pub aborted: usize,
}

impl RebalanceReport {
    fn record(&mut self, status: MigrationStatus) {
        match status {
            MigrationStatus::Success => self.moved += 1,
            MigrationStatus::NotFound => self.missing += 1,
            MigrationStatus::Aborted => self.aborted += 1,
        }
    }
}

/// A sharded key-value store: a hot in-memory tier in front of one SQLite
/// file per shard, with keys placed on shards by a consistent-hash ring.
///
/// Writes hold the target shard's sector lock shared and the key's lock
/// exclusively. A write that cannot get its locks (or a connection) in time
/// is queued for the rescheduler, or rejected once the queue is full.
///
/// Callers must look at the returned [`PutStatus`]: `Queued` and `Rejected`
/// writes are not stored yet, and a queued write is dropped to the dead
/// letter sink if every retry fails.
pub struct ShardedStore {
    config: StoreConfig,
    locks: LockRegistry,
    buffer: Arc<HotBuffer>,
    queue: Arc<RetryQueue>,
    dead_letters: Arc<DeadLetters>,
    stats: Arc<StoreStats>,
    shards: scc::HashMap<ShardId, Arc<ShardStore>>,
    ring: RwLock<Arc<ShardRing>>,
    migrator: MigrationCoordinator,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    membership: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl ShardedStore {
    /// Opens every configured shard. Background services are not running
    /// until [`start`](Self::start).
    pub fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        config.validate()?;
        let token = CancellationToken::new();
        let shards = scc::HashMap::new();
        let shard_ids = config.shard_list();
        for id in &shard_ids {
            let shard = ShardStore::open(
                id.clone(),
                &config.data_path(),
                config.connection_pool_size,
                config.pool_timeout(),
                token.child_token(),
            )?;
            let _ = shards.insert(id.clone(), Arc::new(shard));
        }
        let ring = ShardRing::build(shard_ids, config.virtual_nodes_per_shard);
        let locks = LockRegistry::new(config.max_locks);
        let migrator =
            MigrationCoordinator::new(locks.clone(), config.lock_timeout());
        info!(
            "open store with shards {:?} in '{}'",
            ring.shards(),
            config.data_dir
        );
        Ok(Arc::new(Self {
            locks,
            buffer: Arc::new(HotBuffer::new()),
            queue: Arc::new(RetryQueue::new(config.max_queue_size)),
            dead_letters: Arc::new(DeadLetters::new(config.dead_letter_capacity)),
            stats: Arc::new(StoreStats::default()),
            shards,
            ring: RwLock::new(Arc::new(ring)),
            migrator,
            token,
            tasks: Mutex::new(Vec::new()),
            membership: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            config,
        }))
    }

    /// Spawns the reaper, the rescheduler, the telemetry log and the
    /// maintenance and replication loops of every shard. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let reaper = ExpiryReaper::new(
            self.buffer.clone(),
            self.locks.clone(),
            self.stats.clone(),
            self.config.hot_ttl(),
            self.config.reaper_interval(),
        );
        let rescheduler = Rescheduler::new(
            self.queue.clone(),
            self.dead_letters.clone(),
            self.stats.clone(),
            Arc::downgrade(self),
            self.config.reschedule_interval(),
            self.config.max_retry_attempts,
            self.config.reschedule_workers,
        );
        let mut handles = vec![
            reaper.spawn(self.token.clone()),
            rescheduler.spawn(self.token.clone()),
        ];
        if let Some(interval) = self.config.telemetry_interval() {
            handles.push(spawn_telemetry(
                Arc::downgrade(self),
                self.token.clone(),
                interval,
            ));
        }
        for shard in self.shard_stores() {
            handles.extend(self.spawn_shard_services(&shard));
        }
        self.tasks().extend(handles);
        info!("started store services");
    }

    fn spawn_shard_services(&self, shard: &Arc<ShardStore>) -> [JoinHandle<()>; 2] {
        let maintenance = ShardMaintenance::new(
            shard.clone(),
            self.locks.clone(),
            self.stats.clone(),
            self.config.durable_ttl(),
            self.config.maintenance_interval(),
            self.config.lock_timeout(),
        );
        let replication = self.replication(shard, self.config.replication_interval());
        [maintenance.spawn(), replication.spawn()]
    }

    fn replication(&self, shard: &Arc<ShardStore>, interval: Duration) -> ReplicationService {
        ReplicationService::new(
            shard.clone(),
            &self.config.standby_path(),
            self.stats.clone(),
            interval,
        )
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops every background service, waits for them to exit and closes
    /// all shards. Queued retries that have not run yet are discarded.
    pub async fn close(&self) {
        info!("closing store");
        self.token.cancel();
        let handles: Vec<_> = self.tasks().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("background task ended abnormally: {}", err);
            }
        }
        for shard in self.shard_stores() {
            shard.close();
        }
        if !self.queue.is_empty() {
            warn!("{} queued writes discarded on close", self.queue.len());
        }
    }

    pub fn ring(&self) -> Arc<ShardRing> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_ring(&self, ring: ShardRing) {
        *self.ring.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ring);
    }

    /// Shard currently owning `key`.
    pub fn route_shard(&self, key: &str) -> StoreResult<ShardId> {
        self.ring().route(key).cloned().ok_or(StoreError::NoShards)
    }

    pub fn shard(&self, id: &str) -> Option<Arc<ShardStore>> {
        self.shards.read(id, |_, shard| shard.clone())
    }

    fn require_shard(&self, id: &str) -> StoreResult<Arc<ShardStore>> {
        self.shard(id)
            .ok_or_else(|| StoreError::ShardNotFound(id.to_string()))
    }

    /// Every open shard, including one being drained by `remove_shard`.
    fn shard_stores(&self) -> Vec<Arc<ShardStore>> {
        let mut shards = Vec::new();
        self.shards.scan(|_, shard| shards.push(shard.clone()));
        shards.sort_by(|a, b| a.id().cmp(b.id()));
        shards
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shard_stores().iter().map(|s| s.id().clone()).collect()
    }

    /// Writes `payload` under both locks, re-routing if the ring changed
    /// while waiting for them.
    async fn write(
        &self,
        key: &str,
        payload: &Bytes,
        timeout: Duration,
    ) -> StoreResult<()> {
        loop {
            let shard = self.require_shard(&self.route_shard(key)?)?;
            let _sector = self
                .locks
                .acquire_shared(LockId::Sector(shard.id().clone()), timeout)
                .await?;
            let _key = self
                .locks
                .acquire(LockId::Key(key.to_string()), timeout)
                .await?;
            if self.route_shard(key)? != *shard.id() {
                debug!("key {} moved off shard {} while locking", key, shard.id());
                continue;
            }
            shard.put(key, payload).await?;
            self.buffer.insert(key, payload.clone());
            return Ok(());
        }
    }

    /// Stores `payload` under `key`.
    ///
    /// Lock or connection-pool contention queues the write, or rejects it if
    /// the queue is full. While the queue is full a write does not wait for
    /// its locks at all, so saturation is reported immediately.
    pub async fn put(
        &self,
        key: &str,
        payload: impl Into<Bytes>,
    ) -> StoreResult<PutStatus> {
        let payload = payload.into();
        let timeout = if self.queue.is_full() {
            Duration::ZERO
        } else {
            self.config.lock_timeout()
        };
        let status = match self.write(key, &payload, timeout).await {
            Ok(()) => PutStatus::Success,
            Err(err) if err.is_contention() => {
                let task =
                    RetryTask::new(self.route_shard(key)?, key.to_string(), payload);
                match self.queue.offer(task) {
                    Ok(()) => {
                        debug!("queued write of key {}: {}", key, err);
                        PutStatus::Queued
                    }
                    Err(overflow) => {
                        debug!("rejected write of key {}: {}", key, overflow);
                        PutStatus::Rejected
                    }
                }
            }
            Err(
                err @ (StoreError::NoShards
                | StoreError::ShardNotFound(_)
                | StoreError::Storage(_)
                | StoreError::Io(_)),
            ) => return Err(err),
            Err(err) => {
                warn!("write of key {} failed: {}", key, err);
                PutStatus::Fail
            }
        };
        self.stats.record_put(status);
        Ok(status)
    }

    /// Latest payload of `key`, from the hot tier if it is still there.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let shard = self.require_shard(&self.route_shard(key)?)?;
        let _key = self
            .locks
            .acquire_shared(LockId::Key(key.to_string()), self.config.lock_timeout())
            .await?;
        if let Some(payload) = self.buffer.get(key) {
            return Ok(Some(payload));
        }
        shard.get(key).await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<DeleteStatus> {
        let timeout = self.config.lock_timeout();
        let shard = self.require_shard(&self.route_shard(key)?)?;
        let _sector = self
            .locks
            .acquire_shared(LockId::Sector(shard.id().clone()), timeout)
            .await?;
        let _key = self
            .locks
            .acquire(LockId::Key(key.to_string()), timeout)
            .await?;
        self.buffer.remove(key);
        if shard.delete(key).await? {
            Ok(DeleteStatus::Success)
        } else {
            Ok(DeleteStatus::NotFound)
        }
    }

    /// Moves `key` from shard `from` to shard `to`. The ring is not
    /// consulted: a key moved off its routed shard is no longer visible
    /// through [`get`](Self::get) once it leaves the hot tier.
    pub async fn migrate(
        &self,
        key: &str,
        from: &str,
        to: &str,
    ) -> StoreResult<MigrationStatus> {
        let source = self.require_shard(from)?;
        let dest = self.require_shard(to)?;
        let status = if from == to {
            match source.get_row(key).await? {
                Some(_) => MigrationStatus::Success,
                None => MigrationStatus::NotFound,
            }
        } else {
            self.migrator.migrate(key, &source, &dest).await
        };
        if status == MigrationStatus::Success && from != to {
            self.buffer.remove(key);
        }
        self.stats.record_migration(status);
        Ok(status)
    }

    /// Finishes a migration that returned `Aborted`. Safe to repeat.
    pub async fn reconcile(
        &self,
        key: &str,
        from: &str,
        to: &str,
    ) -> StoreResult<MigrationStatus> {
        let source = self.require_shard(from)?;
        let dest = self.require_shard(to)?;
        if from == to {
            return self.migrate(key, from, to).await;
        }
        let status = self.migrator.reconcile(key, &source, &dest).await;
        if status == MigrationStatus::Success {
            self.buffer.remove(key);
        }
        Ok(status)
    }

    /// Sum of the row counts of every shard. Not a snapshot: shards are
    /// counted one after another while writes continue.
    pub async fn global_count(&self) -> StoreResult<u64> {
        let mut total = 0;
        for shard in self.shard_stores() {
            total += shard.count().await?;
        }
        Ok(total)
    }

    /// Adds an empty shard, rebuilds the ring and moves every key whose
    /// route changed. Any key may move, not only keys next to the new
    /// shard's points.
    pub async fn add_shard(&self, id: &str) -> StoreResult<RebalanceReport> {
        let _membership = self.membership.lock().await;
        if self.shard(id).is_some() {
            return Err(StoreError::DuplicateShard(id.to_string()));
        }
        let Some(ring) = self.ring().with_shard(id) else {
            return Err(StoreError::DuplicateShard(id.to_string()));
        };
        let shard = Arc::new(ShardStore::open(
            id.to_string(),
            &self.config.data_path(),
            self.config.connection_pool_size,
            self.config.pool_timeout(),
            self.token.child_token(),
        )?);
        let _ = self.shards.insert(id.to_string(), shard.clone());
        if self.started.load(Ordering::Acquire) {
            let handles = self.spawn_shard_services(&shard);
            self.tasks().extend(handles);
        }
        self.set_ring(ring);
        info!("added shard {}", id);
        self.rebalance_locked().await
    }

    /// Takes `id` out of the ring, moves its keys to their new shards and
    /// closes it. If some keys could not be moved the shard stays open but
    /// unrouted; a later [`rebalance`](Self::rebalance) finishes the drain.
    pub async fn remove_shard(&self, id: &str) -> StoreResult<RebalanceReport> {
        let _membership = self.membership.lock().await;
        let shard = self.require_shard(id)?;
        if let Some(ring) = self.ring().without_shard(id) {
            if ring.is_empty() {
                return Err(StoreError::NoShards);
            }
            self.set_ring(ring);
        }
        // the leaving shard is still open, so this drains it too
        let report = self.rebalance_locked().await?;
        if report.aborted == 0 {
            shard.close();
            let _ = self.shards.remove(id);
            info!("removed shard {}: {:?}", id, report);
        } else {
            warn!(
                "shard {} left unrouted with {} keys still to move",
                id, report.aborted
            );
        }
        Ok(report)
    }

    /// Moves every key that does not live on the shard the ring routes it
    /// to.
    pub async fn rebalance(&self) -> StoreResult<RebalanceReport> {
        let _membership = self.membership.lock().await;
        self.rebalance_locked().await
    }

    async fn rebalance_locked(&self) -> StoreResult<RebalanceReport> {
        let mut report = RebalanceReport::default();
        for shard in self.shard_stores() {
            self.drain_shard(&shard, &mut report).await?;
        }
        if report.moved > 0 || report.aborted > 0 {
            info!("rebalance: {:?}", report);
        }
        Ok(report)
    }

    /// Migrates the keys of `shard` that route elsewhere.
    async fn drain_shard(
        &self,
        shard: &Arc<ShardStore>,
        report: &mut RebalanceReport,
    ) -> StoreResult<()> {
        for key in shard.keys().await? {
            report.scanned += 1;
            let target = self.route_shard(&key)?;
            if target == *shard.id() {
                continue;
            }
            let status = self.migrate(&key, shard.id(), &target).await?;
            report.record(status);
        }
        Ok(())
    }

    /// Holds the sector lock of `shard` exclusively. Every write routed to
    /// the shard waits (and eventually queues) until the guard is dropped.
    pub async fn fence_shard(&self, shard: &str) -> StoreResult<LockGuard> {
        let shard = self.require_shard(shard)?;
        self.locks
            .acquire(LockId::Sector(shard.id().clone()), self.config.lock_timeout())
            .await
    }

    /// Runs one replication cycle on every shard. Returns how many standby
    /// copies were refreshed; failures are logged and counted.
    pub async fn replicate_all(&self) -> usize {
        let mut replicated = 0;
        for shard in self.shard_stores() {
            let service = self.replication(&shard, self.config.replication_interval());
            if service.replicate_now().await.is_ok() {
                replicated += 1;
            }
        }
        replicated
    }

    /// Runs one maintenance cycle on every shard.
    pub async fn run_maintenance(&self) -> StoreResult<MaintenanceReport> {
        let mut total = MaintenanceReport {
            purged: 0,
            compacted: true,
        };
        for shard in self.shard_stores() {
            let report = ShardMaintenance::new(
                shard,
                self.locks.clone(),
                self.stats.clone(),
                self.config.durable_ttl(),
                self.config.maintenance_interval(),
                self.config.lock_timeout(),
            )
            .run_once()
            .await?;
            total.purged += report.purged;
            total.compacted &= report.compacted;
        }
        Ok(total)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Takes the writes that exhausted their retries.
    pub fn drain_dead_letters(&self) -> Vec<RetryTask> {
        self.dead_letters.drain()
    }

    pub fn lock_registry(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn hot_buffer(&self) -> &HotBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl RetryTarget for ShardedStore {
    async fn redrive(&self, task: &RetryTask) -> StoreResult<()> {
        self.write(&task.key, &task.payload, self.config.lock_timeout())
            .await
    }
}

fn spawn_telemetry(
    store: Weak<ShardedStore>,
    token: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let Some(store) = store.upgrade() else { break };
                    info!(
                        "telemetry: buffer={} locks={} queue={} dead_letters={} {:?}",
                        store.buffer.len(),
                        store.locks.len(),
                        store.queue.len(),
                        store.dead_letters.len(),
                        store.stats.snapshot()
                    );
                }
                _ = token.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store(dir: &TempDir) -> Arc<ShardedStore> {
        let mut config = StoreConfig::default()
            .with_shards(["s1", "s2", "s3"])
            .with_data_dir(dir.path());
        config.lock_timeout_ms = 50;
        ShardedStore::open(config).unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.put("a", "1").await.unwrap(), PutStatus::Success);
        assert_eq!(store.get("a").await.unwrap(), Some(Bytes::from("1")));

        let shard = store.shard(&store.route_shard("a").unwrap()).unwrap();
        assert_eq!(shard.get("a").await.unwrap(), Some(Bytes::from("1")));

        assert_eq!(store.delete("a").await.unwrap(), DeleteStatus::Success);
        assert_eq!(store.delete("a").await.unwrap(), DeleteStatus::NotFound);
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.hot_buffer().is_empty());
    }

    #[tokio::test]
    async fn unknown_shard_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let err = store.migrate("a", "s1", "nope").await.unwrap_err();
        assert!(matches!(err, StoreError::ShardNotFound(ref s) if s == "nope"));
        assert!(store.fence_shard("nope").await.is_err());
    }

    #[tokio::test]
    async fn migrate_to_same_shard_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("a", "1").await.unwrap();
        let home = store.route_shard("a").unwrap();
        assert_eq!(
            store.migrate("a", &home, &home).await.unwrap(),
            MigrationStatus::Success
        );
        assert_eq!(
            store.migrate("missing", &home, &home).await.unwrap(),
            MigrationStatus::NotFound
        );
        assert_eq!(store.global_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_shard_write_fails_without_queueing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let home = store.route_shard("a").unwrap();
        store.shard(&home).unwrap().close();
        assert_eq!(store.put("a", "1").await.unwrap(), PutStatus::Fail);
        assert_eq!(store.queue_len(), 0);
        assert_eq!(store.stats().puts_failed, 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let dir = TempDir::new().unwrap();
        let mut config = StoreConfig::default()
            .with_shards(["s1"])
            .with_data_dir(dir.path());
        config.max_queue_size = 1;
        config.lock_timeout_ms = 60_000;
        let store = ShardedStore::open(config).unwrap();
        let _fence = store
            .lock_registry()
            .acquire(LockId::Sector("s1".into()), Duration::from_secs(1))
            .await
            .unwrap();
        // fill the queue directly so the first put does not wait a minute
        store
            .queue
            .offer(RetryTask::new("s1".into(), "x".into(), Bytes::new()))
            .unwrap();

        let started = std::time::Instant::now();
        assert_eq!(store.put("a", "1").await.unwrap(), PutStatus::Rejected);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(store.queue_len(), 1);
    }
}
