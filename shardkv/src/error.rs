use crate::{lock::LockId, ShardId};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Timed out waiting for lock `{0}`")]
    LockTimeout(LockId),
    #[error("Retry queue is full")]
    QueueOverflow,
    #[error("Connection pool of shard `{0}` is exhausted")]
    PoolExhausted(ShardId),
    #[error("Connection pool of shard `{0}` is closed")]
    PoolClosed(ShardId),
    #[error("No shard `{0}` in this store")]
    ShardNotFound(ShardId),
    #[error("Store has no shards configured")]
    NoShards,
    #[error("Shard `{0}` already exists")]
    DuplicateShard(ShardId),
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Lock and connection-pool timeouts. A write failing with one of these
    /// can be queued and retried later.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout(_) | StoreError::PoolExhausted(_)
        )
    }

    pub(crate) fn from_pool(
        shard: &ShardId,
        value: mobc::Error<rusqlite::Error>,
    ) -> Self {
        match value {
            mobc::Error::Inner(e) => StoreError::Storage(e),
            mobc::Error::Timeout => StoreError::PoolExhausted(shard.clone()),
            mobc::Error::BadConn => StoreError::Storage(
                rusqlite::Error::InvalidQuery,
            ),
            mobc::Error::PoolClosed => StoreError::PoolClosed(shard.clone()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a `put`.
///
/// `Queued` and `Rejected` mean the payload is NOT stored yet. Callers that
/// treat `put` as fire-and-forget will lose writes under sustained overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Success,
    Queued,
    Rejected,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Success,
    NotFound,
}

/// Outcome of moving one key between shards.
///
/// `Aborted` leaves the source as the authoritative copy, but a duplicate may
/// remain in the destination. Use `MigrationCoordinator::reconcile` to repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Success,
    NotFound,
    Aborted,
}
