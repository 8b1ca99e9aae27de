#![forbid(unsafe_code)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use podstat_core::prelude::*;
use podstat_store::{PollConfig, ReconcileConfig, ReconcileError, Reconciler, StateCache};
use support::{descriptor, eventually, record, sample, ClosingEvents, Conn, FakeMetrics, ScriptedEvents};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const NS: &str = "plate-app";

struct Harness {
    cache: Arc<StateCache>,
    metrics: Arc<FakeMetrics>,
    events: Arc<ScriptedEvents>,
    shutdown: CancellationToken,
}

fn harness(script: Vec<Conn>, auto_monitor: bool) -> (Harness, Reconciler) {
    let metrics = Arc::new(FakeMetrics::new());
    let poll = PollConfig { interval: Duration::from_millis(20), evict_after_failures: 1 };
    let cache = Arc::new(StateCache::new(metrics.clone(), poll));
    let events = Arc::new(ScriptedEvents::new(script));
    let cfg = ReconcileConfig { backoff: Duration::from_millis(10), auto_monitor };
    let rec = Reconciler::new(NS, cache.clone(), events.clone(), cfg);
    (Harness { cache, metrics, events, shutdown: CancellationToken::new() }, rec)
}

fn key(name: &str) -> ReplicaKey { ReplicaKey::new(name, NS) }

#[tokio::test]
async fn first_connect_failure_is_fatal() {
    let (h, rec) = harness(vec![Conn::Fail("connection refused")], false);
    let err = rec.start(h.shutdown.clone()).await.expect_err("first open must fail");
    match err {
        ReconcileError::InitialConnect { namespace, .. } => assert_eq!(namespace, NS),
    }
    assert_eq!(h.events.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_and_modified_update_records() {
    let mut restarted = descriptor("mysql", NS, Phase::Running);
    restarted.record.restart_count = 1;
    let script = vec![Conn::Hold(vec![
        ReplicaEvent::Added(descriptor("mysql", NS, Phase::Pending)),
        ReplicaEvent::Modified(restarted),
    ])];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("modified record", || h.cache.get_record(&key("mysql")).map(|r| r.restart_count) == Some(1)).await;
    assert_eq!(h.cache.get_record(&key("mysql")).map(|r| r.phase), Some(Phase::Running));
    assert!(h.cache.get_sample(&key("mysql")).is_none());
    assert!(!h.cache.is_monitored(&key("mysql")));
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_events_are_idempotent() {
    let d = descriptor("etcd", NS, Phase::Running);
    let script = vec![Conn::Hold(vec![
        ReplicaEvent::Added(d.clone()),
        ReplicaEvent::Added(d.clone()),
        ReplicaEvent::Modified(d.clone()),
        ReplicaEvent::Added(descriptor("marker", NS, Phase::Running)),
    ])];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("all events applied", || h.cache.contains(&key("marker"))).await;
    assert_eq!(h.cache.get_record(&key("etcd")), Some(record("etcd", Phase::Running)));
    assert_eq!(h.cache.len(), 2);
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_are_keyed_by_watched_namespace() {
    let script = vec![Conn::Hold(vec![ReplicaEvent::Added(descriptor("stray", "elsewhere", Phase::Failed))])];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("record", || h.cache.contains(&key("stray"))).await;
    assert!(!h.cache.contains(&ReplicaKey::new("stray", "elsewhere")));
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_replicas_get_a_poller_and_deletion_cancels_it() {
    let (tx, rx) = mpsc::unbounded_channel();
    let (h, rec) = harness(vec![Conn::Live(rx)], true);
    h.metrics.set(&key("redis"), sample("redis", 30, 300));
    let task = rec.start(h.shutdown.clone()).await.unwrap();

    tx.send(ReplicaEvent::Added(descriptor("redis", NS, Phase::Running))).unwrap();
    eventually("poller sample", || h.cache.get_sample(&key("redis")).is_some()).await;
    assert!(h.cache.is_monitored(&key("redis")));
    // repeated modifications do not stack pollers
    tx.send(ReplicaEvent::Modified(descriptor("redis", NS, Phase::Running))).unwrap();
    tx.send(ReplicaEvent::Modified(descriptor("redis", NS, Phase::Running))).unwrap();
    tx.send(ReplicaEvent::Added(descriptor("pending", NS, Phase::Pending))).unwrap();
    eventually("pending record", || h.cache.contains(&key("pending"))).await;
    assert_eq!(h.cache.active_pollers(), 1);
    assert!(!h.cache.is_monitored(&key("pending")));

    tx.send(ReplicaEvent::Deleted(descriptor("redis", NS, Phase::Running))).unwrap();
    eventually("eviction", || !h.cache.contains(&key("redis"))).await;
    eventually("poller exit", || h.cache.active_pollers() == 0).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(h.cache.get_sample(&key("redis")).is_none());

    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_unknown_replica_is_harmless() {
    let script = vec![Conn::Hold(vec![
        ReplicaEvent::Deleted(descriptor("never-seen", NS, Phase::Unknown)),
        ReplicaEvent::Added(descriptor("after", NS, Phase::Running)),
    ])];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("later event applied", || h.cache.contains(&key("after"))).await;
    assert_eq!(h.cache.len(), 1);
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_error_reconnects_and_resumes() {
    let script = vec![
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("a", NS, Phase::Running)), ReplicaEvent::Error("too old resource version".into())]),
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("b", NS, Phase::Running))]),
    ];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("event after reconnect", || h.cache.contains(&key("b"))).await;
    assert!(h.cache.contains(&key("a")));
    assert_eq!(h.events.opens(), 2);
    assert!(!task.is_finished());
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_reopens_are_retried() {
    let script = vec![
        Conn::Hold(vec![ReplicaEvent::Error("watch expired".into())]),
        Conn::Fail("apiserver unavailable"),
        Conn::Fail("apiserver unavailable"),
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("c", NS, Phase::Running))]),
    ];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("event after retries", || h.cache.contains(&key("c"))).await;
    assert_eq!(h.events.opens(), 4);
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_stream_is_reopened() {
    let script = vec![
        Conn::End(vec![ReplicaEvent::Added(descriptor("a", NS, Phase::Running))]),
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("b", NS, Phase::Running))]),
    ];
    let (h, rec) = harness(script, false);
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("second stream", || h.cache.contains(&key("b"))).await;
    assert_eq!(h.events.opens(), 2);
    h.shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_ends_reconciler_without_reconnecting() {
    let script = vec![Conn::Hold(vec![ReplicaEvent::Error("boom".into())])];
    let (h, _) = harness(script, false);
    // slow backoff so shutdown lands while waiting to reconnect
    let rec = Reconciler::new(NS, h.cache.clone(), h.events.clone(), ReconcileConfig { backoff: Duration::from_secs(30), auto_monitor: false });
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    h.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.expect("reconciler did not stop").unwrap();
    assert_eq!(h.events.opens(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_closed_streams_wait_for_backoff() {
    let metrics = Arc::new(FakeMetrics::new());
    let cache = Arc::new(StateCache::new(metrics, PollConfig::default()));
    let events = Arc::new(ClosingEvents::default());
    let shutdown = CancellationToken::new();
    let slow = ReconcileConfig { backoff: Duration::from_secs(60), auto_monitor: false };
    let task = Reconciler::new(NS, cache.clone(), events.clone(), slow).start(shutdown.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(events.opens(), 1, "no reopen before the backoff elapses");
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.expect("reconciler did not stop").unwrap();

    let events = Arc::new(ClosingEvents::default());
    let shutdown = CancellationToken::new();
    let quick = ReconcileConfig { backoff: Duration::from_millis(25), auto_monitor: false };
    let task = Reconciler::new(NS, cache, events.clone(), quick).start(shutdown.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(events.opens() >= 2, "closed watch is reopened");
    assert!(events.opens() <= 6, "reopens are paced by the backoff, got {}", events.opens());
    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relisted_watch_prunes_replicas_deleted_while_down() {
    let script = vec![
        Conn::End(vec![
            ReplicaEvent::Added(descriptor("kept", NS, Phase::Pending)),
            ReplicaEvent::Added(descriptor("gone", NS, Phase::Pending)),
        ]),
        Conn::End(vec![ReplicaEvent::Added(descriptor("kept", NS, Phase::Pending))]),
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("marker", NS, Phase::Pending))]),
    ];
    let (h, rec) = harness(script, false);
    // polled replicas are left to their poller
    h.metrics.set(&key("polled"), sample("polled", 1, 1));
    assert!(h.cache.monitor(key("polled")));
    let task = rec.start(h.shutdown.clone()).await.unwrap();

    eventually("third connection", || h.cache.contains(&key("marker"))).await;
    assert!(h.cache.contains(&key("kept")));
    assert!(!h.cache.contains(&key("gone")));
    assert!(h.cache.contains(&key("polled")));
    assert_eq!(h.events.opens(), 3);
    h.shutdown.cancel();
    task.await.unwrap();
    h.cache.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_connection_never_prunes() {
    let script = vec![
        Conn::End(vec![ReplicaEvent::Added(descriptor("a", NS, Phase::Running))]),
        Conn::Hold(vec![ReplicaEvent::Added(descriptor("b", NS, Phase::Running))]),
    ];
    let (h, rec) = harness(script, false);
    h.cache.upsert_record(key("manual"), record("manual", Phase::Running));
    let task = rec.start(h.shutdown.clone()).await.unwrap();
    eventually("second stream", || h.cache.contains(&key("b"))).await;
    assert!(h.cache.contains(&key("manual")));
    h.shutdown.cancel();
    task.await.unwrap();
}
