use std::time::Duration;

use bytes::Bytes;
use shardkv::{shard::ShardStore, PutStatus};
use tokio_util::sync::CancellationToken;

mod common;
use common::TestEnvironment;

#[tokio::test]
async fn routing_is_identical_after_reopen() {
    let env = TestEnvironment::new(&["s1", "s2", "s3"]);
    let keys: Vec<String> = (0..1000).map(|i| format!("user:{i}")).collect();
    let routes: Vec<_> = keys
        .iter()
        .map(|k| env.store.route_shard(k).unwrap())
        .collect();
    let again: Vec<_> = keys
        .iter()
        .map(|k| env.store.route_shard(k).unwrap())
        .collect();
    assert_eq!(routes, again);

    env.store.put("user:7", "seven").await.unwrap();
    let env = env.reopen().await;
    let reopened: Vec<_> = keys
        .iter()
        .map(|k| env.store.route_shard(k).unwrap())
        .collect();
    assert_eq!(routes, reopened);

    // the hot tier starts empty, so this is served by SQLite
    assert!(env.store.hot_buffer().is_empty());
    assert_eq!(
        env.store.get("user:7").await.unwrap(),
        Some(Bytes::from_static(b"seven"))
    );
}

#[tokio::test]
async fn standby_copies_are_named_per_shard() {
    let env = TestEnvironment::new(&["s1", "s2"]);
    let store = &env.store;
    for i in 0..20 {
        store.put(&format!("k{i}"), "v").await.unwrap();
    }
    assert_eq!(store.replicate_all().await, 2);
    assert_eq!(store.stats().replications, 2);

    let standby_dir = store.config().standby_path();
    let mut total = 0;
    for shard in store.shard_ids() {
        let standby = ShardStore::open(
            format!("{shard}_backup"),
            &standby_dir,
            1,
            Duration::from_secs(1),
            CancellationToken::new(),
        )
        .unwrap();
        let primary = store.shard(&shard).unwrap();
        assert_eq!(standby.keys().await.unwrap(), primary.keys().await.unwrap());
        total += standby.count().await.unwrap();
    }
    assert_eq!(total, 20);
}

#[tokio::test]
async fn replication_failure_never_reaches_writers() {
    let env = TestEnvironment::new(&["s1"]);
    let store = &env.store;
    // a directory where the standby file should be makes the rename fail
    let standby_dir = store.config().standby_path();
    std::fs::create_dir_all(standby_dir.join("s1_backup.db")).unwrap();

    assert_eq!(store.replicate_all().await, 0);
    assert_eq!(store.stats().replication_failures, 1);
    assert_eq!(store.put("k", "v").await.unwrap(), PutStatus::Success);
}

#[tokio::test]
async fn maintenance_keeps_fresh_rows() {
    let env = TestEnvironment::new(&["s1", "s2"]);
    let store = &env.store;
    store.put("fresh", "v").await.unwrap();
    let report = store.run_maintenance().await.unwrap();
    assert_eq!(report.purged, 0);
    assert!(report.compacted);
    assert_eq!(store.global_count().await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn hot_entries_expire_after_ttl() {
    let env = TestEnvironment::with_config(&["s1"], |c| {
        c.hot_ttl_secs = 60;
        c.reaper_interval_ms = 10_000;
    });
    let store = &env.store;
    store.start();
    store.put("k", "v").await.unwrap();
    assert!(store.hot_buffer().entry("k").is_some());

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(store.hot_buffer().entry("k").is_some());

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(store.hot_buffer().entry("k").is_none());
    assert!(store.stats().reaped >= 1);
    // the durable tier keeps it
    assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    store.close().await;
}
