use std::time::Duration;

use podstat_store::{PollConfig, ReconcileConfig};

/// Runtime configuration, read from `PODSTAT_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub system_namespace: String,
    pub app_namespace: String,
    pub poll: PollConfig,
    pub reconcile: ReconcileConfig,
    /// Cadence of the daemon's top-N usage report.
    pub report_every: Duration,
    pub top: usize,
    pub metrics_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_namespace: "kube-system".into(),
            app_namespace: "default".into(),
            poll: PollConfig::default(),
            reconcile: ReconcileConfig::default(),
            report_every: Duration::from_secs(30),
            top: 5,
            metrics_addr: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary variable lookup; unset or unparsable values keep their default.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |k: &str, dflt: Duration| var(k).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(dflt);
        Self {
            system_namespace: var("PODSTAT_SYSTEM_NAMESPACE").filter(|s| !s.is_empty()).unwrap_or(d.system_namespace),
            app_namespace: var("PODSTAT_APP_NAMESPACE").filter(|s| !s.is_empty()).unwrap_or(d.app_namespace),
            poll: PollConfig {
                interval: secs("PODSTAT_POLL_SECS", d.poll.interval).max(Duration::from_secs(1)),
                evict_after_failures: var("PODSTAT_EVICT_AFTER_FAILURES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(d.poll.evict_after_failures)
                    .max(1),
            },
            reconcile: ReconcileConfig {
                backoff: secs("PODSTAT_WATCH_BACKOFF_SECS", d.reconcile.backoff),
                auto_monitor: var("PODSTAT_AUTO_MONITOR").and_then(|s| s.parse().ok()).unwrap_or(d.reconcile.auto_monitor),
            },
            report_every: secs("PODSTAT_REPORT_SECS", d.report_every).max(Duration::from_secs(1)),
            top: var("PODSTAT_TOP").and_then(|s| s.parse().ok()).unwrap_or(d.top),
            metrics_addr: var("PODSTAT_METRICS_ADDR").filter(|s| !s.is_empty()),
        }
    }
}
