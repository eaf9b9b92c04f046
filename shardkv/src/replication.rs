use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{error::StoreResult, shard::ShardStore, stats::StoreStats};

/// Standby file of `shard` inside `dir`.
pub fn standby_path(dir: &Path, shard: &str) -> PathBuf {
    dir.join(format!("{shard}_backup.db"))
}

/// Periodic hot backup of one shard to its standby copy.
///
/// Failures are logged and counted, then retried on the next cycle. They
/// never reach foreground callers.
pub struct ReplicationService {
    shard: Arc<ShardStore>,
    standby: PathBuf,
    stats: Arc<StoreStats>,
    interval: Duration,
}

impl ReplicationService {
    pub fn new(
        shard: Arc<ShardStore>,
        standby_dir: &Path,
        stats: Arc<StoreStats>,
        interval: Duration,
    ) -> Self {
        let standby = standby_path(standby_dir, shard.id());
        Self {
            shard,
            standby,
            stats,
            interval,
        }
    }

    pub fn standby(&self) -> &Path {
        &self.standby
    }

    pub async fn replicate_now(&self) -> StoreResult<()> {
        let result = self.shard.backup_to(&self.standby).await;
        match &result {
            Ok(()) => {
                self.stats.replicated();
                debug!(
                    "shard {}: standby synced to '{}'",
                    self.shard.id(),
                    self.standby.display()
                );
            }
            Err(err) => {
                self.stats.replication_failed();
                error!("shard {}: replication failed: {}", self.shard.id(), err);
            }
        }
        result
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let token = self.shard.token().clone();
        tokio::spawn(async move {
            info!(
                "shard {}: start replication to '{}' every {:?}",
                self.shard.id(),
                self.standby.display(),
                self.interval
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        // already logged and counted
                        let _ = self.replicate_now().await;
                    }
                    _ = token.cancelled() => {
                        info!("shard {}: cancelled replication", self.shard.id());
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn shard(dir: &TempDir) -> Arc<ShardStore> {
        Arc::new(
            ShardStore::open(
                "s1".into(),
                dir.path(),
                2,
                Duration::from_secs(1),
                CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn standby_tracks_primary() {
        let dir = TempDir::new().unwrap();
        let standby_dir = dir.path().join("standby");
        let shard = shard(&dir);
        let stats = Arc::new(StoreStats::default());
        let service = ReplicationService::new(
            shard.clone(),
            &standby_dir,
            stats.clone(),
            Duration::from_secs(600),
        );
        assert_eq!(service.standby(), standby_dir.join("s1_backup.db"));

        shard.put("a", b"1").await.unwrap();
        service.replicate_now().await.unwrap();
        shard.put("b", b"2").await.unwrap();
        service.replicate_now().await.unwrap();

        let standby = ShardStore::open(
            "s1_backup".into(),
            &standby_dir,
            1,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(standby.count().await.unwrap(), 2);
        assert_eq!(stats.snapshot().replications, 2);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let dir = TempDir::new().unwrap();
        let shard = shard(&dir);
        let stats = Arc::new(StoreStats::default());
        let service = ReplicationService::new(
            shard.clone(),
            dir.path(),
            stats.clone(),
            Duration::from_millis(10),
        );
        shard.close();
        assert!(service.replicate_now().await.is_err());
        assert_eq!(stats.snapshot().replication_failures, 1);
    }
}
