//! podstat core types: replica identity, cached records, usage samples and watch events.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod source;

pub use source::{EventSource, EventStream, MetricsSource, RecordSource};

pub mod prelude {
    pub use super::{
        EventSource, EventStream, Metric, MetricsSource, Phase, RecordSource, ReplicaDescriptor, ReplicaEvent,
        ReplicaKey, ReplicaRecord, Usage, UsageSample,
    };
}

/// Composite cache key: replica name within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaKey {
    pub name: String,
    pub namespace: String,
}

impl ReplicaKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }

    pub fn in_namespace(&self, namespace: &str) -> bool { self.namespace == namespace }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod lifecycle phase as reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl Phase {
    /// Parse the orchestrator's phase string; unrecognised values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Phase::Pending,
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    pub fn is_running(self) -> bool { matches!(self, Phase::Running) }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Network and health descriptor of a single replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRecord {
    pub name: String,
    pub host_ip: String,
    pub pod_ip: String,
    pub phase: Phase,
    pub restart_count: u32,
    /// Start time of the currently running container, if it is running.
    pub started_at: Option<DateTime<Utc>>,
}

/// One resource dimension: `ratio` is always `used / total * 100` rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "UsageParts")]
pub struct Usage {
    used: u64,
    total: u64,
    ratio: f64,
}

#[derive(Deserialize)]
struct UsageParts {
    used: u64,
    total: u64,
}

impl From<UsageParts> for Usage {
    fn from(p: UsageParts) -> Self { Usage::new(p.used, p.total) }
}

impl Usage {
    pub fn new(used: u64, total: u64) -> Self {
        let ratio = if total == 0 { 0.0 } else { ((used as f64 / total as f64) * 10_000.0).round() / 100.0 };
        Self { used, total, ratio }
    }

    pub fn used(&self) -> u64 { self.used }
    pub fn total(&self) -> u64 { self.total }
    pub fn ratio(&self) -> f64 { self.ratio }
}

/// Point-in-time CPU (millicores) and memory (bytes) usage of one replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub name: String,
    pub cpu: Usage,
    pub memory: Usage,
}

impl UsageSample {
    pub fn new(name: impl Into<String>, cpu: Usage, memory: Usage) -> Self {
        Self { name: name.into(), cpu, memory }
    }

    /// Zero sample used for replicas whose first metric has not arrived yet.
    pub fn empty(name: impl Into<String>) -> Self {
        Self { name: name.into(), cpu: Usage::default(), memory: Usage::default() }
    }
}

/// Metric a sorted snapshot is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Metric {
    /// Ordered by cpu ratio.
    Cpu,
    /// Ordered by memory bytes used.
    Memory,
}

/// Replica as seen on the change-notification stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub key: ReplicaKey,
    pub record: ReplicaRecord,
    /// First diagnostic condition message, if the orchestrator reported one.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicaEvent {
    Added(ReplicaDescriptor),
    Modified(ReplicaDescriptor),
    Deleted(ReplicaDescriptor),
    /// Stream-level failure; the subscription must be reopened.
    Error(String),
}

impl ReplicaEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicaEvent::Added(_) => "added",
            ReplicaEvent::Modified(_) => "modified",
            ReplicaEvent::Deleted(_) => "deleted",
            ReplicaEvent::Error(_) => "error",
        }
    }
}
