//! podstat public API façade (in-process).
//!
//! [`Fleet`] is the context object applications hold: it owns the replica cache, the watch
//! reconcilers of the namespaces being followed and the collaborators used for read-through
//! lookups. Everything the daemon (or an embedding service) needs goes through it.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use podstat_core::prelude::*;
use podstat_store::{ReconcileError, Reconciler, StateCache};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;

pub use config::Config;
pub use podstat_store::{PollConfig, ReconcileConfig};

/// API errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error(transparent)]
    Watch(#[from] ReconcileError),
    #[error("fetching {key} failed")]
    Fetch {
        key: ReplicaKey,
        source: anyhow::Error,
    },
    #[error("connect: {0:#}")]
    Connect(anyhow::Error),
    #[error("fleet is shutting down")]
    ShuttingDown,
}

pub type FleetResult<T> = Result<T, FleetError>;

/// Role of a configured namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceKind {
    System,
    App,
}

pub struct Fleet {
    config: Config,
    cache: Arc<StateCache>,
    events: Arc<dyn EventSource>,
    records: Arc<dyn RecordSource>,
    metrics: Arc<dyn MetricsSource>,
    shutdown: CancellationToken,
    watched: Mutex<HashSet<String>>,
    // held across a first connect so concurrent watches of one namespace share its outcome
    connecting: tokio::sync::Mutex<()>,
    reconcilers: Mutex<Vec<JoinHandle<()>>>,
}

impl Fleet {
    pub fn new(config: Config, events: Arc<dyn EventSource>, metrics: Arc<dyn MetricsSource>, records: Arc<dyn RecordSource>) -> Self {
        let cache = Arc::new(StateCache::new(metrics.clone(), config.poll));
        Self {
            config,
            cache,
            events,
            records,
            metrics,
            shutdown: CancellationToken::new(),
            watched: Mutex::new(HashSet::new()),
            connecting: tokio::sync::Mutex::new(()),
            reconcilers: Mutex::new(Vec::new()),
        }
    }

    /// Fleet backed by the cluster of the ambient kube config.
    pub async fn connect(config: Config) -> FleetResult<Self> {
        let hub = Arc::new(podstat_kubehub::KubeHub::try_default().await.map_err(FleetError::Connect)?);
        Ok(Self::new(config, hub.clone(), hub.clone(), hub))
    }

    pub fn config(&self) -> &Config { &self.config }

    pub fn cache(&self) -> &Arc<StateCache> { &self.cache }

    pub fn namespace(&self, kind: NamespaceKind) -> &str {
        match kind {
            NamespaceKind::System => &self.config.system_namespace,
            NamespaceKind::App => &self.config.app_namespace,
        }
    }

    pub fn key(&self, name: impl Into<String>, kind: NamespaceKind) -> ReplicaKey { ReplicaKey::new(name, self.namespace(kind)) }

    // ----------------- cache point operations -----------------

    pub fn upsert_record(&self, key: ReplicaKey, record: ReplicaRecord) { self.cache.upsert_record(key, record) }

    pub fn upsert_sample(&self, key: ReplicaKey, sample: UsageSample) { self.cache.upsert_sample(key, sample) }

    pub fn get_record(&self, key: &ReplicaKey) -> Option<ReplicaRecord> { self.cache.get_record(key) }

    pub fn get_sample(&self, key: &ReplicaKey) -> Option<UsageSample> { self.cache.get_sample(key) }

    /// Drop the entry and stop its poller. Returns whether it existed.
    pub fn remove(&self, key: &ReplicaKey) -> bool { self.cache.remove(key) }

    /// Cached record, or fetched from the cluster and cached.
    pub async fn record_or_fetch(&self, key: &ReplicaKey) -> FleetResult<ReplicaRecord> {
        if let Some(r) = self.cache.get_record(key) {
            return Ok(r);
        }
        let r = self
            .records
            .fetch_record(key)
            .await
            .map_err(|source| FleetError::Fetch { key: key.clone(), source })?;
        self.cache.upsert_record(key.clone(), r.clone());
        Ok(r)
    }

    /// Cached usage sample, or fetched once and cached.
    pub async fn sample_or_fetch(&self, key: &ReplicaKey) -> FleetResult<UsageSample> {
        if let Some(s) = self.cache.get_sample(key) {
            return Ok(s);
        }
        let s = self
            .metrics
            .fetch_sample(key)
            .await
            .map_err(|source| FleetError::Fetch { key: key.clone(), source })?;
        self.cache.upsert_sample(key.clone(), s.clone());
        Ok(s)
    }

    // ----------------- queries -----------------

    pub fn snapshot_sorted_by_cpu(&self, namespace: &str, descending: bool) -> Vec<UsageSample> {
        self.cache.snapshot_sorted_by_cpu(namespace, descending)
    }

    pub fn snapshot_sorted_by_memory(&self, namespace: &str, descending: bool) -> Vec<UsageSample> {
        self.cache.snapshot_sorted_by_memory(namespace, descending)
    }

    /// Replica names cached in `namespace`, sorted.
    pub fn names(&self, namespace: &str) -> Vec<String> { self.cache.names(namespace) }

    // ----------------- pollers -----------------

    pub fn monitor(&self, key: ReplicaKey) -> bool { self.cache.monitor(key) }

    pub fn monitor_all<I, S>(&self, namespace: &str, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache.monitor_all(namespace, names)
    }

    // ----------------- lifecycle -----------------

    /// Start reconciling `namespace`. A namespace already watched is left alone.
    ///
    /// Watches are connected one at a time: a caller arriving while the same namespace is
    /// still connecting waits, then returns `Ok` if that connect succeeded or tries again
    /// itself if it failed.
    pub async fn watch_namespace(&self, namespace: &str) -> FleetResult<()> {
        let _connecting = self.connecting.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(FleetError::ShuttingDown);
        }
        if self.watched.lock().contains(namespace) {
            return Ok(());
        }
        let rec = Reconciler::new(namespace, self.cache.clone(), self.events.clone(), self.config.reconcile);
        let handle = rec.start(self.shutdown.clone()).await?;
        self.watched.lock().insert(namespace.to_string());
        self.reconcilers.lock().push(handle);
        Ok(())
    }

    /// Watch both configured namespaces.
    pub async fn watch_configured(&self) -> FleetResult<()> {
        let system = self.config.system_namespace.clone();
        let app = self.config.app_namespace.clone();
        self.watch_namespace(&system).await?;
        self.watch_namespace(&app).await
    }

    pub fn watched(&self) -> Vec<String> {
        let mut v: Vec<String> = self.watched.lock().iter().cloned().collect();
        v.sort();
        v
    }

    /// Stop every reconciler, then every poller, and wait for all of them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.reconcilers.lock());
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "reconciler task failed");
            }
        }
        self.cache.shutdown().await;
        info!(entries = self.cache.len(), "fleet stopped");
    }
}
