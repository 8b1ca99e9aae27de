//! Per-replica stat poller.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use podstat_core::ReplicaKey;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::StateCache;

/// Refresh the sample of `key` every poll interval until `token` fires or the replica
/// stops resolving. The first fetch happens immediately.
pub(crate) async fn run(cache: Arc<StateCache>, key: ReplicaKey, token: CancellationToken) {
    let poll = cache.poll_config();
    let evict_after = poll.evict_after_failures.max(1);
    let mut ticker = tokio::time::interval(poll.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;
    debug!(replica = %key, every_ms = poll.interval.as_millis() as u64, "stat poller started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = cache.metrics.fetch_sample(&key) => res,
        };
        histogram!("podstat_fetch_ms", started.elapsed().as_secs_f64() * 1000.0);
        match fetched {
            Ok(sample) => {
                failures = 0;
                if !cache.store_polled(&key, &token, sample) {
                    break;
                }
                counter!("podstat_poll_samples_total", 1u64);
            }
            Err(e) => {
                failures += 1;
                counter!("podstat_poll_failures_total", 1u64);
                if failures < evict_after {
                    warn!(replica = %key, error = %e, failures, "stat fetch failed");
                    continue;
                }
                warn!(replica = %key, error = %e, failures, "stat fetch failed; evicting replica");
                token.cancel();
                if cache.evict_cancelled(&key) {
                    counter!("podstat_poll_evictions_total", 1u64);
                }
                break;
            }
        }
    }
    debug!(replica = %key, "stat poller stopped");
}
