//! Collaborator seams: where samples, records and watch events come from.

use anyhow::Result;
use futures::stream::BoxStream;

use crate::{ReplicaEvent, ReplicaKey, ReplicaRecord, UsageSample};

/// A live per-namespace subscription. Ends when the server closes the watch.
pub type EventStream = BoxStream<'static, ReplicaEvent>;

/// Opens change-notification streams for a namespace.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, namespace: &str) -> Result<EventStream>;
}

/// Fetches an instantaneous usage sample for one replica.
///
/// An error is read by pollers as "the replica no longer resolves".
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_sample(&self, key: &ReplicaKey) -> Result<UsageSample>;
}

/// Fetches a replica's network/health descriptor on demand (cache miss path).
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_record(&self, key: &ReplicaKey) -> Result<ReplicaRecord>;
}
