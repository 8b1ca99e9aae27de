//! Watch reconciliation: turns a namespace's change-notification stream into cache writes.
//!
//! The first connection is made synchronously by [`Reconciler::start`] and its failure is
//! fatal to the caller. After that the loop owns the subscription and reopens it until the
//! shutdown token fires, waiting `backoff` after a failure or an empty close.
//!
//! Every watch starts with the full current pod list, so a reopened connection that closes
//! cleanly has replayed the namespace. Entries it never mentioned, and that have no live
//! poller, were deleted while the watch was down and are pruned.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use podstat_core::{EventSource, EventStream, ReplicaDescriptor, ReplicaEvent, ReplicaKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::StateCache;

const MIN_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Wait before reopening a failed watch.
    pub backoff: Duration,
    /// Start a stat poller for replicas observed in the Running phase.
    pub auto_monitor: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self { Self { backoff: Duration::from_secs(60), auto_monitor: true } }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("initial watch of namespace {namespace} failed")]
    InitialConnect {
        namespace: String,
        #[source]
        source: anyhow::Error,
    },
}

enum StreamEnd {
    Cancelled,
    Closed,
    Failed(String),
}

pub struct Reconciler {
    namespace: String,
    cache: Arc<StateCache>,
    source: Arc<dyn EventSource>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(namespace: impl Into<String>, cache: Arc<StateCache>, source: Arc<dyn EventSource>, config: ReconcileConfig) -> Self {
        Self { namespace: namespace.into(), cache, source, config }
    }

    pub fn namespace(&self) -> &str { &self.namespace }

    /// Open the watch and spawn the reconcile loop. Fails only if the first open fails.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>, ReconcileError> {
        let stream = match self.source.open(&self.namespace).await {
            Ok(s) => s,
            Err(source) => {
                error!(ns = %self.namespace, error = %source, "initial watch failed");
                return Err(ReconcileError::InitialConnect { namespace: self.namespace.clone(), source });
            }
        };
        info!(ns = %self.namespace, "watch started");
        Ok(tokio::spawn(self.run(stream, shutdown)))
    }

    async fn run(self, first: EventStream, shutdown: CancellationToken) {
        let mut current = Some(first);
        let mut wait = Duration::ZERO;
        loop {
            let (mut stream, reopened) = match current.take() {
                Some(s) => (s, false),
                None => match self.reopen(wait, &shutdown).await {
                    Some(s) => (s, true),
                    None => break,
                },
            };
            let known = if reopened { self.cache.names(&self.namespace) } else { Vec::new() };
            let mut seen = HashSet::new();
            let end = tokio::select! {
                biased;
                _ = shutdown.cancelled() => StreamEnd::Cancelled,
                end = self.drain(&mut stream, &mut seen) => end,
            };
            drop(stream);
            wait = match end {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed if seen.is_empty() => {
                    debug!(ns = %self.namespace, "watch closed without events; backing off");
                    self.config.backoff.max(MIN_RETRY)
                }
                StreamEnd::Closed => {
                    if reopened {
                        self.prune_unseen(&known, &seen);
                    }
                    debug!(ns = %self.namespace, events = seen.len(), "watch closed by server; reopening");
                    MIN_RETRY
                }
                StreamEnd::Failed(msg) => {
                    warn!(ns = %self.namespace, error = %msg, "watch stream error; reconnecting");
                    self.config.backoff.max(MIN_RETRY)
                }
            };
        }
        info!(ns = %self.namespace, "watch stopped");
    }

    /// Retry opening the watch until it succeeds or shutdown fires.
    async fn reopen(&self, mut wait: Duration, shutdown: &CancellationToken) -> Option<EventStream> {
        loop {
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            let opened = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                res = self.source.open(&self.namespace) => res,
            };
            match opened {
                Ok(s) => {
                    counter!("podstat_watch_reconnects_total", 1u64, "ns" => self.namespace.clone());
                    info!(ns = %self.namespace, "watch reopened");
                    return Some(s);
                }
                Err(e) => {
                    wait = self.config.backoff.max(MIN_RETRY);
                    warn!(ns = %self.namespace, error = %e, retry_in_ms = wait.as_millis() as u64, "watch reconnect failed");
                }
            }
        }
    }

    /// Apply events until the stream ends; names of the replicas mentioned go into `seen`.
    async fn drain(&self, stream: &mut EventStream, seen: &mut HashSet<String>) -> StreamEnd {
        while let Some(event) = stream.next().await {
            counter!("podstat_watch_events_total", 1u64, "kind" => event.kind());
            match event {
                ReplicaEvent::Added(d) => {
                    seen.insert(d.key.name.clone());
                    self.apply(d, true);
                }
                ReplicaEvent::Modified(d) => {
                    seen.insert(d.key.name.clone());
                    self.apply(d, false);
                }
                ReplicaEvent::Deleted(d) => {
                    seen.insert(d.key.name.clone());
                    let key = self.key_of(&d);
                    warn!(replica = %key, phase = %d.record.phase, "replica deleted; evicting");
                    self.cache.remove(&key);
                }
                ReplicaEvent::Error(msg) => return StreamEnd::Failed(msg),
            }
        }
        StreamEnd::Closed
    }

    fn prune_unseen(&self, known: &[String], seen: &HashSet<String>) {
        let mut pruned = 0usize;
        for name in known.iter().filter(|n| !seen.contains(n.as_str())) {
            let key = ReplicaKey::new(name.clone(), self.namespace.clone());
            if !self.cache.is_monitored(&key) && self.cache.remove(&key) {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(ns = %self.namespace, pruned, "dropped replicas missing from the relisted watch");
        }
    }

    // Events are keyed by the watched namespace.
    fn key_of(&self, d: &ReplicaDescriptor) -> ReplicaKey { ReplicaKey::new(d.key.name.clone(), self.namespace.clone()) }

    fn apply(&self, d: ReplicaDescriptor, added: bool) {
        let key = self.key_of(&d);
        let ReplicaDescriptor { record, message, .. } = d;
        if added {
            info!(replica = %key, phase = %record.phase, "replica added");
        } else {
            debug!(replica = %key, phase = %record.phase, restarts = record.restart_count, "replica modified");
        }
        let running = record.phase.is_running();
        if !running {
            if let Some(msg) = message.as_deref().filter(|m| !m.is_empty()) {
                warn!(replica = %key, phase = %record.phase, message = %msg, "replica not running");
            }
        }
        self.cache.upsert_record(key.clone(), record);
        if self.config.auto_monitor && running {
            self.cache.monitor(key);
        }
    }
}
