//! End-to-end control loop scenarios over the in-memory list/watch source
//! and lease store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use converge_runtime::leader::LeaderElector;
use converge_runtime::{
    Action, Backoff, InMemoryLeaseStore, InMemoryListWatch, LeaderElectionConfig, Manager,
    ManagerConfig, ReconcileError, ReconcileLoop, ReconcileResult, Reconciler, ResourceKey,
    ResourceWatcher, Shutdown, TypeRegistry, WorkQueue,
};

fn key(name: &str) -> ResourceKey {
    ResourceKey::namespaced("default", name)
}

fn config_map(name: &str, revision: u32) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("revision".to_string(), revision.to_string())])),
        ..Default::default()
    }
}

fn revision(object: &ConfigMap) -> u32 {
    object
        .data
        .as_ref()
        .and_then(|data| data.get("revision"))
        .and_then(|r| r.parse().ok())
        .unwrap_or(0)
}

/// Records every reconciliation as (key, observed revision). Clones share
/// the record.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(ResourceKey, Option<u32>)>>>,
}

impl Recorder {
    fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    fn revisions_of(&self, key: &ResourceKey) -> Vec<u32> {
        self.seen
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, rev)| *rev)
            .collect()
    }
}

#[async_trait]
impl Reconciler<ConfigMap> for Recorder {
    async fn reconcile(&self, key: &ResourceKey, object: Option<Arc<ConfigMap>>) -> ReconcileResult {
        self.seen
            .lock()
            .push((key.clone(), object.as_deref().map(revision)));
        Ok(Action::Done)
    }
}

fn election(holder: &str) -> LeaderElectionConfig {
    LeaderElectionConfig::new(
        "newresource-controller".to_string(),
        "default".to_string(),
        holder.to_string(),
        Duration::from_millis(800),
        Duration::from_millis(400),
        Duration::from_millis(50),
    )
    .unwrap()
}

fn manager_config(holder: &str) -> ManagerConfig {
    ManagerConfig {
        metrics_addr: None,
        health_addr: "127.0.0.1:0".parse().unwrap(),
        leader_election: election(holder),
        workers: 2,
        backoff: Backoff::default(),
        shutdown_grace: Duration::from_secs(1),
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Two replicas race for the lease; only the winner reconciles, and the
/// standby takes over once the winner shuts down.
#[tokio::test]
async fn exactly_one_replica_reconciles() {
    let source = InMemoryListWatch::new();
    for name in ["a", "b", "c"] {
        source.upsert(key(name), config_map(name, 1));
    }
    let leases = InMemoryLeaseStore::new();
    let mut registry = TypeRegistry::new();
    registry.register::<ConfigMap>();

    let recorders = [Recorder::default(), Recorder::default()];
    let stops = [Shutdown::new(), Shutdown::new()];
    let mut tasks = Vec::new();
    for (i, (recorder, stop)) in recorders.iter().zip(&stops).enumerate() {
        let manager = Manager::new(
            manager_config(&format!("replica-{i}")),
            &registry,
            source.clone(),
            recorder.clone(),
        )
        .unwrap()
        .with_lease_store(leases.clone());
        tasks.push(tokio::spawn(manager.run(stop.signal())));
    }

    eventually("a leader to reconcile all keys", || {
        recorders.iter().any(|r| r.calls() >= 3)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let leader = recorders
        .iter()
        .position(|r| r.calls() > 0)
        .expect("one replica leads");
    let follower = 1 - leader;
    assert_eq!(recorders[follower].calls(), 0, "follower must not reconcile");
    assert_eq!(
        leases.snapshot("newresource-controller").unwrap().lease.holder,
        Some(format!("replica-{leader}"))
    );

    // Leader steps down and releases; the standby takes over.
    stops[leader].trigger();
    let mut tasks: Vec<_> = tasks.into_iter().map(Some).collect();
    tasks[leader].take().unwrap().await.unwrap().unwrap();
    eventually("the standby to take over", || recorders[follower].calls() >= 3).await;

    stops[follower].trigger();
    tasks[follower].take().unwrap().await.unwrap().unwrap();
}

/// Spawn a watcher over `source` feeding `queue`; returns its store.
fn start_watcher(
    source: &InMemoryListWatch<ConfigMap>,
    queue: &WorkQueue,
    stop: &Shutdown,
) -> converge_runtime::Store<ConfigMap> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ResourceWatcher::new(source.clone(), tx);
    let store = watcher.store();
    tokio::spawn(watcher.run(stop.signal()));
    let queue = queue.clone();
    tokio::spawn(async move {
        while let Some(key) = rx.recv().await {
            queue.add(key);
        }
    });
    store
}

/// Create plus two updates before any worker runs collapse into a single
/// reconciliation that sees the newest revision.
#[tokio::test]
async fn burst_of_updates_reconciles_once_with_newest_state() {
    let source = InMemoryListWatch::new();
    let queue = WorkQueue::new(Backoff::default());
    let stop = Shutdown::new();
    let store = start_watcher(&source, &queue, &stop);
    source.wait_for_watchers(1).await;

    source.upsert(key("a"), config_map("a", 0));
    source.upsert(key("a"), config_map("a", 1));
    source.upsert(key("a"), config_map("a", 2));
    eventually("cache to hold revision 2", || {
        store
            .get(&key("a"))
            .is_some_and(|obj| revision(obj.payload()) == 2)
    })
    .await;
    assert_eq!(queue.len(), 1);

    let recorder = Recorder::default();
    let control = ReconcileLoop::new(queue.clone(), store, Arc::new(recorder.clone()));
    let term = Shutdown::new();
    let running = tokio::spawn({
        let control = control.clone();
        let signal = term.signal();
        async move { control.run_term(signal).await }
    });

    eventually("one reconciliation", || recorder.calls() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.revisions_of(&key("a")), vec![2]);

    term.trigger();
    stop.trigger();
    running.await.unwrap();
}

/// Fails `failures` times per key, then succeeds; records call instants.
struct Flaky {
    failures: usize,
    calls: Mutex<Vec<tokio::time::Instant>>,
}

#[async_trait]
impl Reconciler<ConfigMap> for Flaky {
    async fn reconcile(&self, _: &ResourceKey, _: Option<Arc<ConfigMap>>) -> ReconcileResult {
        let mut calls = self.calls.lock();
        calls.push(tokio::time::Instant::now());
        if calls.len() <= self.failures {
            Err(ReconcileError::transient("backend unavailable"))
        } else {
            Ok(Action::Done)
        }
    }
}

/// Transient failures are retried at growing, capped delays until success.
#[tokio::test(start_paused = true)]
async fn transient_failures_retry_with_capped_backoff() {
    let source = InMemoryListWatch::new();
    source.upsert(key("a"), config_map("a", 1));
    let queue = WorkQueue::new(Backoff::new(Duration::from_secs(1), Duration::from_secs(2)));
    let stop = Shutdown::new();
    let store = start_watcher(&source, &queue, &stop);

    let flaky = Arc::new(Flaky {
        failures: 3,
        calls: Mutex::default(),
    });
    let control = ReconcileLoop::new(queue.clone(), store, Arc::clone(&flaky));
    let term = Shutdown::new();
    let running = tokio::spawn({
        let control = control.clone();
        let signal = term.signal();
        async move { control.run_term(signal).await }
    });

    tokio::time::sleep(Duration::from_secs(60)).await;
    let calls = flaky.calls.lock().clone();
    assert_eq!(calls.len(), 4, "three failures then one success");

    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, want) in gaps.iter().zip([1, 2, 2].map(Duration::from_secs)) {
        assert!(*gap >= want && *gap < want + Duration::from_millis(100), "gap {gap:?}, want {want:?}");
    }
    assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(queue.num_requeues(&key("a")), 0);

    term.trigger();
    stop.trigger();
    running.await.unwrap();
}

/// Blocks the first reconciliation until released, counts all starts.
struct Gate {
    started: AtomicUsize,
    started_after_loss: AtomicUsize,
    lost: Arc<AtomicBool>,
    open: tokio::sync::Notify,
}

#[async_trait]
impl Reconciler<ConfigMap> for Gate {
    async fn reconcile(&self, _: &ResourceKey, _: Option<Arc<ConfigMap>>) -> ReconcileResult {
        if self.lost.load(Ordering::SeqCst) {
            self.started_after_loss.fetch_add(1, Ordering::SeqCst);
        }
        if self.started.fetch_add(1, Ordering::SeqCst) == 0 {
            self.open.notified().await;
        }
        Ok(Action::Done)
    }
}

/// Renewal fails while a reconciliation is in flight: once `on_lost` has
/// run, no further reconciliation starts, even after the in-flight one
/// completes and more keys are queued.
#[tokio::test]
async fn lost_lease_stops_new_reconciliations() {
    let source = InMemoryListWatch::new();
    source.upsert(key("a"), config_map("a", 1));
    let queue = WorkQueue::new(Backoff::default());
    let stop = Shutdown::new();
    let store = start_watcher(&source, &queue, &stop);

    let lost = Arc::new(AtomicBool::new(false));
    let gate = Arc::new(Gate {
        started: AtomicUsize::new(0),
        started_after_loss: AtomicUsize::new(0),
        lost: Arc::clone(&lost),
        open: tokio::sync::Notify::new(),
    });
    let control = ReconcileLoop::new(queue.clone(), store, Arc::clone(&gate))
        .with_workers(2)
        .with_grace_period(Duration::from_secs(5));

    let leases = InMemoryLeaseStore::new();
    let elector = Arc::new(LeaderElector::new(leases.clone(), election("solo")));
    let election_stop = Shutdown::new();
    let term_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::default();

    let electing = tokio::spawn({
        let elector = Arc::clone(&elector);
        let signal = election_stop.signal();
        let control = control.clone();
        let term_tasks = Arc::clone(&term_tasks);
        let lost = Arc::clone(&lost);
        async move {
            elector
                .run(
                    signal,
                    move |term| {
                        let control = control.clone();
                        term_tasks
                            .lock()
                            .push(tokio::spawn(async move { control.run_term(term).await }));
                    },
                    move || lost.store(true, Ordering::SeqCst),
                )
                .await
        }
    });

    eventually("first reconciliation to start", || {
        gate.started.load(Ordering::SeqCst) == 1
    })
    .await;

    leases.fail_writes(true);
    eventually("leadership loss", || lost.load(Ordering::SeqCst)).await;

    // Let the in-flight reconciliation finish and queue more work.
    gate.open.notify_waiters();
    for name in ["b", "c", "d"] {
        source.upsert(key(name), config_map(name, 1));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(gate.started.load(Ordering::SeqCst), 1);
    assert_eq!(gate.started_after_loss.load(Ordering::SeqCst), 0);
    assert!(queue.len() >= 3);

    election_stop.trigger();
    electing.await.unwrap();
    let handles: Vec<_> = term_tasks.lock().drain(..).collect();
    for handle in handles {
        handle.await.unwrap();
    }
    stop.trigger();
}

/// A dropped watch followed by history compaction forces a full relist; the
/// cache and the reconciler never go back to an older revision.
#[tokio::test]
async fn resync_never_regresses_observed_versions() {
    let source = InMemoryListWatch::new();
    let queue = WorkQueue::new(Backoff::default());
    let stop = Shutdown::new();
    let store = start_watcher(&source, &queue, &stop);
    source.wait_for_watchers(1).await;

    let recorder = Recorder::default();
    let control = ReconcileLoop::new(queue.clone(), store.clone(), Arc::new(recorder.clone()))
        .with_workers(3);
    let term = Shutdown::new();
    let running = tokio::spawn({
        let control = control.clone();
        let signal = term.signal();
        async move { control.run_term(signal).await }
    });

    let observed: Arc<Mutex<HashMap<ResourceKey, u32>>> = Arc::default();
    let check_monotonic = {
        let store = store.clone();
        let observed = Arc::clone(&observed);
        move || {
            let mut observed = observed.lock();
            for k in store.keys() {
                if let Some(obj) = store.get(&k) {
                    let rev = revision(obj.payload());
                    let last = observed.entry(k).or_insert(rev);
                    assert!(rev >= *last, "cache went back from {last} to {rev}");
                    *last = rev;
                }
            }
        }
    };

    for rev in 1..=3 {
        for name in ["a", "b"] {
            source.upsert(key(name), config_map(name, rev));
        }
        check_monotonic();
    }

    source.disconnect();
    source.compact();
    for rev in 4..=6 {
        source.upsert(key("a"), config_map("a", rev));
        check_monotonic();
    }
    source.delete(&key("b"));

    eventually("relist to converge the cache", || {
        check_monotonic();
        store.get(&key("b")).is_none()
            && store
                .get(&key("a"))
                .is_some_and(|obj| revision(obj.payload()) == 6)
    })
    .await;
    assert!(source.list_calls() >= 2);

    eventually("reconciler to observe the newest revision", || {
        recorder.revisions_of(&key("a")).last() == Some(&6)
    })
    .await;

    // The reconciler never observed an older revision after a newer one.
    for name in ["a", "b"] {
        let revisions = recorder.revisions_of(&key(name));
        assert!(
            revisions.windows(2).all(|w| w[0] <= w[1]),
            "{name} went backwards: {revisions:?}"
        );
    }

    term.trigger();
    stop.trigger();
    running.await.unwrap();
}
