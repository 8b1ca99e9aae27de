#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use podstat_core::prelude::*;
use tokio::sync::mpsc;

pub fn record(name: &str, phase: Phase) -> ReplicaRecord {
    ReplicaRecord { name: name.into(), host_ip: "node-1".into(), pod_ip: "10.1.0.9".into(), phase, restart_count: 0, started_at: None }
}

pub fn descriptor(name: &str, ns: &str, phase: Phase) -> ReplicaDescriptor {
    ReplicaDescriptor { key: ReplicaKey::new(name, ns), record: record(name, phase), message: None }
}

pub fn sample(name: &str, cpu_used: u64, mem_used: u64) -> UsageSample {
    UsageSample::new(name, Usage::new(cpu_used, 100), Usage::new(mem_used, 1 << 30))
}

/// Poll `cond` every few ms; panic after two seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Metrics source backed by a map; keys without a sample fail the fetch.
#[derive(Default)]
pub struct FakeMetrics {
    samples: Mutex<HashMap<ReplicaKey, UsageSample>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeMetrics {
    pub fn new() -> Self { Self::default() }

    pub fn slow(delay: Duration) -> Self { Self { delay: Some(delay), ..Self::default() } }

    pub fn set(&self, key: &ReplicaKey, s: UsageSample) { self.samples.lock().unwrap().insert(key.clone(), s); }

    pub fn forget(&self, key: &ReplicaKey) { self.samples.lock().unwrap().remove(key); }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl MetricsSource for FakeMetrics {
    async fn fetch_sample(&self, key: &ReplicaKey) -> anyhow::Result<UsageSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.samples
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("pod metrics for {} not found", key))
    }
}

/// One scripted connection attempt.
pub enum Conn {
    /// Opening fails.
    Fail(&'static str),
    /// Yields the events, then stays open.
    Hold(Vec<ReplicaEvent>),
    /// Yields the events, then the server closes the stream.
    End(Vec<ReplicaEvent>),
    /// Forwards whatever the test sends.
    Live(mpsc::UnboundedReceiver<ReplicaEvent>),
}

/// Event source replaying one scripted connection per `open`; an exhausted script stays idle.
#[derive(Default)]
pub struct ScriptedEvents {
    script: Mutex<VecDeque<Conn>>,
    opens: AtomicUsize,
}

impl ScriptedEvents {
    pub fn new(script: Vec<Conn>) -> Self { Self { script: Mutex::new(script.into()), opens: AtomicUsize::new(0) } }

    pub fn opens(&self) -> usize { self.opens.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl EventSource for ScriptedEvents {
    async fn open(&self, namespace: &str) -> anyhow::Result<EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Conn::Fail(msg)) => Err(anyhow::anyhow!("watch {}: {}", namespace, msg)),
            Some(Conn::Hold(events)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
            Some(Conn::End(events)) => Ok(stream::iter(events).boxed()),
            Some(Conn::Live(mut rx)) => Ok(async_stream::stream! {
                while let Some(ev) = rx.recv().await {
                    yield ev;
                }
            }
            .boxed()),
            None => Ok(stream::pending::<ReplicaEvent>().boxed()),
        }
    }
}

/// Event source whose every stream ends at once without delivering anything.
#[derive(Default)]
pub struct ClosingEvents {
    opens: AtomicUsize,
}

impl ClosingEvents {
    pub fn opens(&self) -> usize { self.opens.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl EventSource for ClosingEvents {
    async fn open(&self, _namespace: &str) -> anyhow::Result<EventStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(stream::empty::<ReplicaEvent>().boxed())
    }
}
