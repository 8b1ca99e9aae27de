//! Sorted read views over the cache.

use podstat_core::{Metric, UsageSample};

use crate::StateCache;

/// Stable sort: cpu by ratio, memory by bytes used. Ties keep their input order.
pub fn sort_samples(mut samples: Vec<UsageSample>, metric: Metric, descending: bool) -> Vec<UsageSample> {
    samples.sort_by(|a, b| {
        let ord = match metric {
            Metric::Cpu => a.cpu.ratio().total_cmp(&b.cpu.ratio()),
            Metric::Memory => a.memory.used().cmp(&b.memory.used()),
        };
        if descending { ord.reverse() } else { ord }
    });
    samples
}

impl StateCache {
    pub fn snapshot_sorted(&self, namespace: &str, metric: Metric, descending: bool) -> Vec<UsageSample> {
        sort_samples(self.snapshot(namespace), metric, descending)
    }

    pub fn snapshot_sorted_by_cpu(&self, namespace: &str, descending: bool) -> Vec<UsageSample> {
        self.snapshot_sorted(namespace, Metric::Cpu, descending)
    }

    pub fn snapshot_sorted_by_memory(&self, namespace: &str, descending: bool) -> Vec<UsageSample> {
        self.snapshot_sorted(namespace, Metric::Memory, descending)
    }
}
