//! podstat kubehub: kube-rs backed pod watch, pod records and metrics.k8s.io usage samples.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::{Api, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use podstat_core::prelude::*;
use tracing::{debug, info};

mod quantity;

pub use quantity::{parse_cpu_millis, parse_memory_bytes};

/// A replica `<name>` runs as the single pod `<name>-0` of its StatefulSet.
pub fn pod_name(replica: &str) -> String { format!("{replica}-0") }

/// Strip the StatefulSet ordinal from a pod name.
pub fn replica_name(pod: &str) -> &str { pod.strip_suffix("-0").unwrap_or(pod) }

/// Replica record from a pod; `name` is the replica name, not the pod name.
pub fn record_from(pod: &Pod, name: &str) -> ReplicaRecord {
    let status = pod.status.as_ref();
    let first = status.and_then(|s| s.container_statuses.as_ref()).and_then(|c| c.first());
    ReplicaRecord {
        name: name.to_string(),
        host_ip: status.and_then(|s| s.host_ip.clone()).unwrap_or_default(),
        pod_ip: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        phase: status.and_then(|s| s.phase.as_deref()).map(Phase::parse).unwrap_or_default(),
        restart_count: first.map(|c| c.restart_count.max(0) as u32).unwrap_or(0),
        started_at: first
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.running.as_ref())
            .and_then(|r| r.started_at.as_ref())
            .map(|t| t.0),
    }
}

/// Watch-stream view of a pod in `namespace`.
pub fn descriptor_from(pod: &Pod, namespace: &str) -> ReplicaDescriptor {
    let name = replica_name(pod.metadata.name.as_deref().unwrap_or_default());
    let message = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.first())
        .and_then(|c| c.message.clone());
    ReplicaDescriptor { key: ReplicaKey::new(name, namespace), record: record_from(pod, name), message }
}

fn map_event(ev: kube::Result<WatchEvent<Pod>>, namespace: &str) -> Option<ReplicaEvent> {
    match ev {
        Ok(WatchEvent::Added(p)) => Some(ReplicaEvent::Added(descriptor_from(&p, namespace))),
        Ok(WatchEvent::Modified(p)) => Some(ReplicaEvent::Modified(descriptor_from(&p, namespace))),
        Ok(WatchEvent::Deleted(p)) => Some(ReplicaEvent::Deleted(descriptor_from(&p, namespace))),
        Ok(WatchEvent::Bookmark(_)) => None,
        Ok(WatchEvent::Error(e)) => Some(ReplicaEvent::Error(format!("{} ({})", e.message, e.code))),
        Err(e) => Some(ReplicaEvent::Error(e.to_string())),
    }
}

/// Sum container usage of a PodMetrics object into (millicores, bytes).
fn sum_usage(metrics: &serde_json::Value) -> Result<(u64, u64)> {
    let containers = metrics
        .get("containers")
        .and_then(|c| c.as_array())
        .ok_or_else(|| anyhow!("pod metrics carry no containers"))?;
    let mut cpu = 0u64;
    let mut mem = 0u64;
    for c in containers {
        let usage = c.get("usage");
        if let Some(q) = usage.and_then(|u| u.get("cpu")).and_then(|q| q.as_str()) {
            cpu += parse_cpu_millis(q)?;
        }
        if let Some(q) = usage.and_then(|u| u.get("memory")).and_then(|q| q.as_str()) {
            mem += parse_memory_bytes(q)?;
        }
    }
    Ok((cpu, mem))
}

fn node_capacity(node: &Node) -> Result<(u64, u64)> {
    let cap = node
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .ok_or_else(|| anyhow!("node reports no capacity"))?;
    let cpu = cap.get("cpu").map(|q| parse_cpu_millis(&q.0)).transpose()?.unwrap_or(0);
    let mem = cap.get("memory").map(|q| parse_memory_bytes(&q.0)).transpose()?.unwrap_or(0);
    Ok((cpu, mem))
}

enum Watch {
    Connected,
    Refused(kube::Error),
    Event(ReplicaEvent),
}

/// Kubernetes-backed implementation of the podstat collaborator traits.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    pod_metrics: ApiResource,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        Self { client, pod_metrics: ApiResource::from_gvk_with_plural(&gvk, "pods") }
    }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> { Api::namespaced(self.client.clone(), namespace) }

    async fn pod(&self, key: &ReplicaKey) -> Result<Pod> {
        let name = pod_name(&key.name);
        self.pods(&key.namespace).get(&name).await.with_context(|| format!("getting pod {}/{}", key.namespace, name))
    }
}

#[async_trait::async_trait]
impl EventSource for KubeHub {
    async fn open(&self, namespace: &str) -> Result<EventStream> {
        let api = self.pods(namespace);
        let ns = namespace.to_string();
        // the request future borrows the Api, so the whole watch lives inside the stream
        let mut watch = async_stream::stream! {
            let wp = WatchParams::default();
            match api.watch(&wp, "0").await {
                Err(e) => yield Watch::Refused(e),
                Ok(events) => {
                    yield Watch::Connected;
                    futures::pin_mut!(events);
                    while let Some(ev) = events.next().await {
                        if let Some(ev) = map_event(ev, &ns) {
                            yield Watch::Event(ev);
                        }
                    }
                }
            }
        }
        .boxed();
        match watch.next().await {
            Some(Watch::Connected) => {}
            Some(Watch::Refused(e)) => return Err(anyhow::Error::new(e).context(format!("watching pods in {namespace}"))),
            _ => return Err(anyhow!("pod watch in {namespace} ended before connecting")),
        }
        info!(ns = %namespace, "pod watch connected");
        Ok(watch
            .filter_map(|w| future::ready(match w {
                Watch::Event(ev) => Some(ev),
                _ => None,
            }))
            .boxed())
    }
}

#[async_trait::async_trait]
impl RecordSource for KubeHub {
    async fn fetch_record(&self, key: &ReplicaKey) -> Result<ReplicaRecord> {
        let pod = self.pod(key).await?;
        Ok(record_from(&pod, &key.name))
    }
}

#[async_trait::async_trait]
impl MetricsSource for KubeHub {
    async fn fetch_sample(&self, key: &ReplicaKey) -> Result<UsageSample> {
        let pod = self.pod(key).await?;
        let node_name = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .or_else(|| pod.status.as_ref().and_then(|s| s.host_ip.clone()))
            .ok_or_else(|| anyhow!("pod for {key} is not scheduled"))?;
        let node = Api::<Node>::all(self.client.clone())
            .get(&node_name)
            .await
            .with_context(|| format!("getting node {node_name}"))?;
        let (cpu_total, mem_total) = node_capacity(&node)?;

        let name = pod_name(&key.name);
        let metrics: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &key.namespace, &self.pod_metrics);
        let pm = metrics
            .get(&name)
            .await
            .with_context(|| format!("getting pod metrics {}/{}", key.namespace, name))?;
        let (cpu_used, mem_used) = sum_usage(&pm.data)?;
        debug!(replica = %key, node = %node_name, cpu_used, mem_used, "usage sample fetched");
        Ok(UsageSample::new(key.name.clone(), Usage::new(cpu_used, cpu_total), Usage::new(mem_used, mem_total)))
    }
}
