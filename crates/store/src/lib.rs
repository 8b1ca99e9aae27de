//! podstat store: sharded in-RAM replica cache with one stat poller per monitored entry.
//!
//! Entries live in a `DashMap` keyed by [`ReplicaKey`]; each entry swaps its record and its
//! usage sample independently (`ArcSwapOption`), so a record writer and a sample writer on the
//! same key never overwrite each other. Readers only hold a shard lock long enough to clone
//! the entry's current `Arc`.

#![forbid(unsafe_code)]

use std::hash::BuildHasherDefault;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::gauge;
use podstat_core::{MetricsSource, ReplicaKey, ReplicaRecord, UsageSample};
use rustc_hash::FxHasher;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

mod poller;
mod query;
mod reconcile;

pub use query::sort_samples;
pub use reconcile::{ReconcileConfig, ReconcileError, Reconciler};

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Stat poller cadence and eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// Consecutive fetch failures after which the replica is treated as gone (min 1).
    pub evict_after_failures: u32,
}

impl Default for PollConfig {
    fn default() -> Self { Self { interval: Duration::from_secs(3), evict_after_failures: 1 } }
}

/// One cache slot.
struct CacheEntry {
    record: ArcSwapOption<ReplicaRecord>,
    sample: ArcSwapOption<UsageSample>,
    /// Set at most once, when the entry's poller is started.
    poller: OnceLock<CancellationToken>,
}

impl CacheEntry {
    fn new() -> Self {
        Self { record: ArcSwapOption::empty(), sample: ArcSwapOption::empty(), poller: OnceLock::new() }
    }

    fn cancel_poller(&self) {
        if let Some(token) = self.poller.get() {
            token.cancel();
        }
    }

    fn poller_cancelled(&self) -> bool { self.poller.get().map_or(false, |t| t.is_cancelled()) }

    fn poller_live(&self) -> bool { self.poller.get().map_or(false, |t| !t.is_cancelled()) }
}

/// Concurrent replica cache. Share it as `Arc<StateCache>`; pollers hold a clone.
pub struct StateCache {
    entries: DashMap<ReplicaKey, Arc<CacheEntry>, FxBuildHasher>,
    metrics: Arc<dyn MetricsSource>,
    poll: PollConfig,
    shutdown: CancellationToken,
    pollers: TaskTracker,
}

impl StateCache {
    pub fn new(metrics: Arc<dyn MetricsSource>, poll: PollConfig) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher::default()),
            metrics,
            poll,
            shutdown: CancellationToken::new(),
            pollers: TaskTracker::new(),
        }
    }

    pub fn poll_config(&self) -> PollConfig { self.poll }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn contains(&self, key: &ReplicaKey) -> bool { self.entries.contains_key(key) }

    /// Run `f` against the entry for `key`, creating it first if absent.
    /// The shard lock is held for the duration of `f`, so `f` must not touch the map.
    fn with_slot<R>(&self, key: ReplicaKey, f: impl FnOnce(&CacheEntry) -> R) -> R {
        if let Some(e) = self.entries.get(&key) {
            return f(e.value().as_ref());
        }
        let out = {
            let e = self.entries.entry(key).or_insert_with(|| Arc::new(CacheEntry::new()));
            f(e.value().as_ref())
        };
        gauge!("podstat_cache_entries", self.entries.len() as f64);
        out
    }

    /// Replace the record of `key`, leaving its sample and poller untouched.
    pub fn upsert_record(&self, key: ReplicaKey, record: ReplicaRecord) {
        let record = Arc::new(record);
        self.with_slot(key, |e| e.record.store(Some(record)));
    }

    /// Replace the sample of `key`, leaving its record and poller untouched.
    pub fn upsert_sample(&self, key: ReplicaKey, sample: UsageSample) {
        let sample = Arc::new(sample);
        self.with_slot(key, |e| e.sample.store(Some(sample)));
    }

    pub fn get_record(&self, key: &ReplicaKey) -> Option<ReplicaRecord> {
        let record = self.entries.get(key)?.record.load_full()?;
        Some((*record).clone())
    }

    pub fn get_sample(&self, key: &ReplicaKey) -> Option<UsageSample> {
        let sample = self.entries.get(key)?.sample.load_full()?;
        Some((*sample).clone())
    }

    /// Cancel the entry's poller (if any) and drop the entry. Unknown keys are a no-op.
    pub fn remove(&self, key: &ReplicaKey) -> bool {
        let removed = match self.entries.entry(key.clone()) {
            Entry::Occupied(o) => {
                o.get().cancel_poller();
                o.remove();
                true
            }
            Entry::Vacant(_) => false,
        };
        if removed {
            debug!(replica = %key, "cache entry removed");
            gauge!("podstat_cache_entries", self.entries.len() as f64);
        }
        removed
    }

    /// Drop the entry only if its poller has already been cancelled (poller self-eviction).
    fn evict_cancelled(&self, key: &ReplicaKey) -> bool {
        let evicted = self.entries.remove_if(key, |_, e| e.poller_cancelled()).is_some();
        if evicted {
            gauge!("podstat_cache_entries", self.entries.len() as f64);
        }
        evicted
    }

    /// Poller write path: stores only while the entry exists and `token` is still live.
    /// The shard read lock held here excludes a concurrent `remove`.
    fn store_polled(&self, key: &ReplicaKey, token: &CancellationToken, sample: UsageSample) -> bool {
        let Some(e) = self.entries.get(key) else { return false };
        if token.is_cancelled() {
            return false;
        }
        e.sample.store(Some(Arc::new(sample)));
        true
    }

    /// One usage sample per entry of `namespace`, ordered by replica name.
    /// Entries without a sample yet are reported as zero samples.
    pub fn snapshot(&self, namespace: &str) -> Vec<UsageSample> {
        let mut rows: Vec<(String, UsageSample)> = self
            .entries
            .iter()
            .filter(|e| e.key().in_namespace(namespace))
            .map(|e| {
                let name = e.key().name.clone();
                let sample = match e.value().sample.load_full() {
                    Some(s) => (*s).clone(),
                    None => UsageSample::empty(name.clone()),
                };
                (name, sample)
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows.into_iter().map(|(_, s)| s).collect()
    }

    /// Replica names known in `namespace`, sorted.
    pub fn names(&self, namespace: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().in_namespace(namespace))
            .map(|e| e.key().name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Start the stat poller for `key`, creating the entry if needed.
    /// Returns false when the entry already has a poller or the cache is shut down.
    pub fn monitor(self: &Arc<Self>, key: ReplicaKey) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let token = self.with_slot(key.clone(), |e| {
            if e.poller.get().is_some() {
                return None;
            }
            let token = self.shutdown.child_token();
            e.poller.set(token.clone()).ok()?;
            Some(token)
        });
        let Some(token) = token else { return false };
        self.pollers.spawn(poller::run(Arc::clone(self), key, token));
        true
    }

    /// Start pollers for every name in `namespace`; returns how many were started.
    pub fn monitor_all<I, S>(self: &Arc<Self>, namespace: &str, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut started = 0;
        for name in names {
            if self.monitor(ReplicaKey::new(name, namespace)) {
                started += 1;
            }
        }
        info!(ns = %namespace, started, "monitoring requested");
        started
    }

    /// True while `key` has an entry with a live poller.
    pub fn is_monitored(&self, key: &ReplicaKey) -> bool {
        self.entries.get(key).map_or(false, |e| e.poller_live())
    }

    /// Number of poller tasks that have not finished yet.
    pub fn active_pollers(&self) -> usize { self.pollers.len() }

    pub fn is_shut_down(&self) -> bool { self.shutdown.is_cancelled() }

    /// Cancel every poller and wait for all of them to exit. Cached data stays readable.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pollers.close();
        self.pollers.wait().await;
        info!(entries = self.entries.len(), "stat pollers stopped");
    }
}
