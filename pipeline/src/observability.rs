//! In-process counters and latency quantiles per pipeline stage, exposed
//! as a snapshot. External metrics backends are out of scope; this is the
//! observable surface the health endpoint serves.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use serde::Serialize;

const SAMPLE_WINDOW: usize = 512;

#[derive(Default)]
pub struct StageMetrics {
    count: AtomicU64,
    errors: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StageSnapshot {
    pub count: u64,
    pub errors: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
}

impl StageMetrics {
    pub fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == SAMPLE_WINDOW {
                samples.pop_front();
            }
            samples.push_back(millis);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn quantile(sorted: &[u64], q: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
        sorted.get(rank).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> StageSnapshot {
        let mut sorted: Vec<u64> = self
            .samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();
        StageSnapshot {
            count: self.count.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            p50_ms: Self::quantile(&sorted, 0.5),
            p95_ms: Self::quantile(&sorted, 0.95),
        }
    }
}

#[derive(Default)]
pub struct Observability {
    pub retrieve: StageMetrics,
    pub rerank: StageMetrics,
    pub generate: StageMetrics,
    pub index: StageMetrics,
    pub graph: StageMetrics,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub retrieve: StageSnapshot,
    pub rerank: StageSnapshot,
    pub generate: StageSnapshot,
    pub index: StageSnapshot,
    pub graph: StageSnapshot,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            retrieve: self.retrieve.snapshot(),
            rerank: self.rerank.snapshot(),
            generate: self.generate.snapshot(),
            index: self.index.snapshot(),
            graph: self.graph.snapshot(),
        }
    }
}
