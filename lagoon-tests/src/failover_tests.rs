//! Leader churn, restart resume, and replica convergence.

use std::time::Duration;

use bytes::Bytes;
use lagoon_core::{
    HybridConfig, Offset, PartitionId, ProducerGuid, StoreVersionConfig, StoreVersionNumber,
};

use crate::harness::{run_batch_push, wait_until, LogWriter, TestCluster};

const PARTITION: PartitionId = PartitionId::new(0);

fn hybrid_version(store: &str) -> StoreVersionConfig {
    StoreVersionConfig::new(store, StoreVersionNumber::new(1))
        .with_hybrid(HybridConfig::new(100).with_offset_lag_threshold(2))
}

/// Kill the leader mid-stream, promote the follower, stream more, restart
/// and re-promote the former leader: every key becomes readable everywhere.
#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover_keeps_all_keys_readable() {
    let cluster = TestCluster::new(2);
    let version = hybrid_version("failover_store");
    cluster.start_version(&version).await;
    run_batch_push(
        &cluster.broker,
        &version,
        &[("base".to_string(), "batch".to_string())],
    );
    cluster.promote(&version, PARTITION, 0);

    let mut rt_writer = LogWriter::new(&cluster.broker, version.real_time_topic(), 1);
    for i in 0..10 {
        rt_writer.put_to(PARTITION, &format!("k{i}"), &format!("v{i}"));
    }
    wait_until("follower caught up before kill", Duration::from_secs(15), || {
        cluster.read(1, &version, PARTITION, "k9").is_some()
    })
    .await;

    // Kill the leader without draining and fail over.
    cluster.stop_replica(0, &version, false).await;
    cluster.promote(&version, PARTITION, 1);

    for i in 10..20 {
        rt_writer.put_to(PARTITION, &format!("k{i}"), &format!("v{i}"));
    }
    wait_until("new leader streams", Duration::from_secs(15), || {
        cluster.read(1, &version, PARTITION, "k19").is_some()
    })
    .await;

    // The former leader restarts as a follower and catches up.
    cluster.restart_replica(0, &version).await;
    wait_until("restarted replica catches up", Duration::from_secs(15), || {
        cluster.read(0, &version, PARTITION, "k19").is_some()
    })
    .await;

    // Re-promote the former leader and keep streaming.
    cluster.promote(&version, PARTITION, 0);
    for i in 20..25 {
        rt_writer.put_to(PARTITION, &format!("k{i}"), &format!("v{i}"));
    }

    for replica in 0..2 {
        wait_until("all keys readable", Duration::from_secs(15), || {
            cluster.read(replica, &version, PARTITION, "k24").is_some()
        })
        .await;
        for i in 0..25 {
            assert_eq!(
                cluster.read(replica, &version, PARTITION, &format!("k{i}")),
                Some(Bytes::from(format!("v{i}"))),
                "replica {replica} missing k{i} after failover"
            );
        }
    }
    cluster.shutdown().await;
}

/// With producers quiesced and all in-flight messages drained, both
/// replicas hold identical persisted records, duplicates and churn
/// notwithstanding.
#[tokio::test(flavor = "multi_thread")]
async fn test_replicas_converge_after_churn() {
    let cluster = TestCluster::new(2);
    let version = hybrid_version("converge_store");
    cluster.start_version(&version).await;
    run_batch_push(
        &cluster.broker,
        &version,
        &(0..20)
            .map(|i| (format!("k{i}"), format!("batch_{i}")))
            .collect::<Vec<_>>(),
    );
    cluster.promote(&version, PARTITION, 0);

    // Stream with explicit duplicates.
    let raw_writer = LogWriter::new(&cluster.broker, version.real_time_topic(), 1);
    let guid = ProducerGuid::random();
    raw_writer.put_raw(PARTITION, "k1", "s1", guid, 0, 1);
    raw_writer.put_raw(PARTITION, "k2", "s2", guid, 0, 2);
    raw_writer.put_raw(PARTITION, "k1", "s1", guid, 0, 1);
    raw_writer.put_raw(PARTITION, "k3", "s3", guid, 0, 3);
    wait_until("first wave applied", Duration::from_secs(15), || {
        cluster.read(0, &version, PARTITION, "k3").is_some()
    })
    .await;

    // Fail over mid-stream and keep writing with the same producer.
    cluster.promote(&version, PARTITION, 1);
    raw_writer.put_raw(PARTITION, "k4", "s4", guid, 0, 4);
    raw_writer.put_raw(PARTITION, "k2", "s2", guid, 0, 2);
    raw_writer.put_raw(PARTITION, "k5", "s5", guid, 0, 5);

    for replica in 0..2 {
        wait_until("both replicas drain", Duration::from_secs(15), || {
            cluster.read(replica, &version, PARTITION, "k5").is_some()
        })
        .await;
    }

    let left = cluster.store(0, &version, PARTITION).scan();
    let right = cluster.store(1, &version, PARTITION).scan();
    assert_eq!(left, right, "replicas diverged after churn");
    cluster.shutdown().await;
}

/// `local_vt_offset` never regresses across restarts and role changes.
#[tokio::test(flavor = "multi_thread")]
async fn test_vt_offset_monotonic_across_restarts() {
    let cluster = TestCluster::new(1);
    let version = StoreVersionConfig::new("mono_store", StoreVersionNumber::new(1));
    cluster.start_version(&version).await;
    run_batch_push(
        &cluster.broker,
        &version,
        &[("k".to_string(), "v".to_string())],
    );

    let store = cluster.store(0, &version, PARTITION);
    wait_until("batch applied", Duration::from_secs(10), || {
        store.get(b"k").is_some()
    })
    .await;
    let first = store.local_vt_offset();
    assert!(first > Offset::earliest());

    cluster.stop_replica(0, &version, true).await;
    cluster.restart_replica(0, &version).await;
    wait_until("restart settles", Duration::from_secs(10), || {
        store.checkpoint().is_some()
    })
    .await;
    let second = store.local_vt_offset();
    assert!(second >= first);

    // More records after the restart keep advancing the offset.
    let vt_writer = LogWriter::new(&cluster.broker, version.version_topic(), 1);
    vt_writer.put_raw(PARTITION, "k2", "v2", ProducerGuid::random(), 0, 1);
    wait_until("post-restart record applied", Duration::from_secs(10), || {
        store.get(b"k2").is_some()
    })
    .await;
    assert!(store.local_vt_offset() > second);
    cluster.shutdown().await;
}

/// A drained stop finishes the leader's open segment; the next leader (the
/// same replica, restarted) opens a new one and followers accept both.
#[tokio::test(flavor = "multi_thread")]
async fn test_drained_stop_and_resume_streaming() {
    let cluster = TestCluster::new(2);
    let version = hybrid_version("drain_store");
    cluster.start_version(&version).await;
    run_batch_push(
        &cluster.broker,
        &version,
        &[("base".to_string(), "batch".to_string())],
    );
    cluster.promote(&version, PARTITION, 0);

    let mut rt_writer = LogWriter::new(&cluster.broker, version.real_time_topic(), 1);
    rt_writer.put_to(PARTITION, "before", "stop");
    wait_until("streamed before stop", Duration::from_secs(15), || {
        cluster.read(1, &version, PARTITION, "before").is_some()
    })
    .await;

    cluster.stop_replica(0, &version, true).await;
    cluster.restart_replica(0, &version).await;
    cluster.promote(&version, PARTITION, 0);

    rt_writer.put_to(PARTITION, "after", "restart");
    for replica in 0..2 {
        wait_until("streamed after restart", Duration::from_secs(15), || {
            cluster.read(replica, &version, PARTITION, "after").is_some()
        })
        .await;
    }
    cluster.shutdown().await;
}
