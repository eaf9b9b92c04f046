use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::{
    error::{StoreError, StoreResult},
    ShardId,
};

/// Identifier of a lock handed out by [`LockRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Guards mutations of a single key.
    Key(String),
    /// Guards a whole shard. Ordinary writes hold it shared; an exclusive
    /// holder stalls every write routed to the shard.
    Sector(ShardId),
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Key(key) => write!(f, "key/{key}"),
            LockId::Sector(shard) => write!(f, "sector/{shard}"),
        }
    }
}

struct Slot {
    lock: Arc<RwLock<()>>,
    refs: usize,
    tick: u64,
}

#[derive(Default)]
struct Table {
    slots: HashMap<LockId, Slot>,
    /// Recency order, oldest first.
    order: BTreeMap<u64, LockId>,
    tick: u64,
}

impl Table {
    fn touch(&mut self, id: &LockId) -> Option<Arc<RwLock<()>>> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.slots.get_mut(id)?;
        self.order.remove(&slot.tick);
        slot.tick = tick;
        slot.refs += 1;
        self.order.insert(tick, id.clone());
        Some(slot.lock.clone())
    }

    fn insert(&mut self, id: LockId) -> Arc<RwLock<()>> {
        self.tick += 1;
        let lock = Arc::new(RwLock::new(()));
        self.order.insert(self.tick, id.clone());
        self.slots.insert(
            id,
            Slot {
                lock: lock.clone(),
                refs: 1,
                tick: self.tick,
            },
        );
        lock
    }

    /// Removes the least recently used lock nobody references.
    fn evict_idle(&mut self) -> bool {
        let victim = self
            .order
            .iter()
            .find(|(_, id)| self.slots.get(*id).is_some_and(|s| s.refs == 0))
            .map(|(tick, id)| (*tick, id.clone()));
        match victim {
            Some((tick, id)) => {
                self.order.remove(&tick);
                self.slots.remove(&id);
                true
            }
            None => false,
        }
    }

    fn remove_if_idle(&mut self, id: &LockId) -> bool {
        match self.slots.get(id) {
            Some(slot) if slot.refs == 0 => {
                self.order.remove(&slot.tick);
                self.slots.remove(id);
                true
            }
            _ => false,
        }
    }
}

struct Inner {
    max_locks: usize,
    table: Mutex<Table>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: &LockId) {
        let mut table = self.table();
        if let Some(slot) = table.slots.get_mut(id) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        while table.slots.len() > self.max_locks && table.evict_idle() {}
    }
}

/// Bounded cache of per-key and per-shard locks with LRU eviction.
///
/// Every caller referencing a lock (waiting for it or holding it) counts as a
/// reference, and only unreferenced locks are ever evicted. When all cached
/// locks are referenced the registry grows past `max_locks` instead, and
/// shrinks back as references are released.
#[derive(Clone)]
pub struct LockRegistry {
    inner: Arc<Inner>,
}

impl LockRegistry {
    pub fn new(max_locks: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_locks: max_locks.max(1),
                table: Mutex::new(Table::default()),
            }),
        }
    }

    fn checkout(&self, id: &LockId) -> (Arc<RwLock<()>>, Lease) {
        let mut table = self.inner.table();
        let lock = match table.touch(id) {
            Some(lock) => lock,
            None => {
                if table.slots.len() >= self.inner.max_locks
                    && !table.evict_idle()
                {
                    debug!(
                        "all {} locks are in use, growing past the limit for {}",
                        table.slots.len(),
                        id
                    );
                }
                table.insert(id.clone())
            }
        };
        let lease = Lease {
            inner: self.inner.clone(),
            id: id.clone(),
        };
        (lock, lease)
    }

    /// Acquires `id` exclusively, waiting at most `timeout`.
    pub async fn acquire(
        &self,
        id: LockId,
        timeout: Duration,
    ) -> StoreResult<LockGuard> {
        let (lock, lease) = self.checkout(&id);
        match tokio::time::timeout(timeout, lock.write_owned()).await {
            Ok(guard) => Ok(LockGuard {
                guard: GuardKind::Exclusive(guard),
                lease,
            }),
            Err(_) => Err(StoreError::LockTimeout(id)),
        }
    }

    /// Acquires `id` in shared mode, waiting at most `timeout`.
    pub async fn acquire_shared(
        &self,
        id: LockId,
        timeout: Duration,
    ) -> StoreResult<LockGuard> {
        let (lock, lease) = self.checkout(&id);
        match tokio::time::timeout(timeout, lock.read_owned()).await {
            Ok(guard) => Ok(LockGuard {
                guard: GuardKind::Shared(guard),
                lease,
            }),
            Err(_) => Err(StoreError::LockTimeout(id)),
        }
    }

    /// Acquires `id` exclusively only if nobody holds it right now.
    pub fn try_acquire(&self, id: LockId) -> Option<LockGuard> {
        let (lock, lease) = self.checkout(&id);
        lock.try_write_owned().ok().map(|guard| LockGuard {
            guard: GuardKind::Exclusive(guard),
            lease,
        })
    }

    /// Like [`try_acquire`](Self::try_acquire) but in shared mode.
    pub fn try_acquire_shared(&self, id: LockId) -> Option<LockGuard> {
        let (lock, lease) = self.checkout(&id);
        lock.try_read_owned().ok().map(|guard| LockGuard {
            guard: GuardKind::Shared(guard),
            lease,
        })
    }

    /// Drops the lock for `id` if nobody references it.
    pub fn discard_idle(&self, id: &LockId) -> bool {
        self.inner.table().remove_if_idle(id)
    }

    pub fn len(&self) -> usize {
        self.inner.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_locks(&self) -> usize {
        self.inner.max_locks
    }

    /// Number of callers currently waiting for or holding `id`.
    pub fn ref_count(&self, id: &LockId) -> Option<usize> {
        self.inner.table().slots.get(id).map(|slot| slot.refs)
    }
}

struct Lease {
    inner: Arc<Inner>,
    id: LockId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release(&self.id);
    }
}

enum GuardKind {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// A held lock. Unlocks and releases its registry reference on drop.
pub struct LockGuard {
    // declared before `lease` so the lock is released first
    guard: GuardKind,
    lease: Lease,
}

impl LockGuard {
    pub fn id(&self) -> &LockId {
        &self.lease.id
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, GuardKind::Exclusive(_))
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("id", &self.lease.id)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}
