//! Pipeline metrics
//!
//! Counters are plain atomics. Latency samples (enqueue → snapshot published)
//! live in a fixed-capacity ring behind a `parking_lot::Mutex`; percentiles are
//! computed on read by sorting a copy. Queue depth is the number of ingest
//! calls that have entered the pipeline and not yet finished, per game and
//! process-wide.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::error::{IngestOutcome, RejectReason};

#[derive(Debug, Clone)]
struct MetricsSample {
    gid: Arc<str>,
    enqueue_ts: Instant,
    process_ts: Instant,
}

impl MetricsSample {
    fn latency_ms(&self) -> f64 {
        self.process_ts
            .saturating_duration_since(self.enqueue_ts)
            .as_secs_f64()
            * 1000.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GameMetrics {
    pub gid: String,
    pub queue_depth: u64,
    pub p95_latency_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected_malformed: u64,
    pub rejected_out_of_order: u64,
    pub rejected_partition_closed: u64,
    pub queue_depth: u64,
    pub latency: LatencySummary,
    pub latency_bound_ms: f64,
    pub p95_within_bound: bool,
}

/// Decrements queue depth when dropped.
pub struct InFlight {
    game: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.game.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct PipelineMetrics {
    ring: Mutex<VecDeque<MetricsSample>>,
    capacity: usize,
    latency_bound_ms: f64,

    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected_malformed: AtomicU64,
    rejected_out_of_order: AtomicU64,
    rejected_partition_closed: AtomicU64,

    in_flight: Arc<AtomicU64>,
    game_in_flight: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl PipelineMetrics {
    pub fn new(capacity: usize, latency_bound_ms: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            latency_bound_ms,
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            rejected_malformed: AtomicU64::new(0),
            rejected_out_of_order: AtomicU64::new(0),
            rejected_partition_closed: AtomicU64::new(0),
            in_flight: Arc::new(AtomicU64::new(0)),
            game_in_flight: RwLock::new(HashMap::new()),
        }
    }

    fn game_counter(&self, gid: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.game_in_flight.read().get(gid) {
            return counter.clone();
        }
        self.game_in_flight
            .write()
            .entry(gid.to_string())
            .or_default()
            .clone()
    }

    /// Mark an ingest call as queued until the returned guard drops.
    pub fn enter(&self, gid: &str) -> InFlight {
        let game = self.game_counter(gid);
        game.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight {
            game,
            total: self.in_flight.clone(),
        }
    }

    pub fn record_outcome(&self, outcome: &IngestOutcome) {
        let counter = match outcome {
            IngestOutcome::Accepted => &self.accepted,
            IngestOutcome::Duplicate => &self.duplicates,
            IngestOutcome::Rejected(RejectReason::Malformed) => &self.rejected_malformed,
            IngestOutcome::Rejected(RejectReason::OutOfOrder) => &self.rejected_out_of_order,
            IngestOutcome::Rejected(RejectReason::PartitionClosed) => {
                &self.rejected_partition_closed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, gid: &str, enqueue_ts: Instant, process_ts: Instant) {
        let sample = MetricsSample {
            gid: Arc::from(gid),
            enqueue_ts,
            process_ts,
        };
        let mut ring = self.ring.lock();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    pub fn queue_depth(&self, gid: &str) -> u64 {
        self.game_in_flight
            .read()
            .get(gid)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn game(&self, gid: &str) -> GameMetrics {
        let mut latencies: Vec<f64> = self
            .ring
            .lock()
            .iter()
            .filter(|s| &*s.gid == gid)
            .map(MetricsSample::latency_ms)
            .collect();
        GameMetrics {
            gid: gid.to_string(),
            queue_depth: self.queue_depth(gid),
            p95_latency_ms: percentile(&mut latencies, 95.0),
            samples: latencies.len(),
        }
    }

    pub fn latency(&self) -> LatencySummary {
        let mut latencies: Vec<f64> = self.ring.lock().iter().map(MetricsSample::latency_ms).collect();
        LatencySummary {
            samples: latencies.len(),
            p50_ms: percentile(&mut latencies, 50.0),
            p95_ms: percentile(&mut latencies, 95.0),
            p99_ms: percentile(&mut latencies, 99.0),
            max_ms: latencies.last().copied().unwrap_or(0.0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.latency();
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected_malformed: self.rejected_malformed.load(Ordering::Relaxed),
            rejected_out_of_order: self.rejected_out_of_order.load(Ordering::Relaxed),
            rejected_partition_closed: self.rejected_partition_closed.load(Ordering::Relaxed),
            queue_depth: self.in_flight.load(Ordering::Relaxed),
            p95_within_bound: latency.p95_ms <= self.latency_bound_ms,
            latency_bound_ms: self.latency_bound_ms,
            latency,
        }
    }
}

/// Nearest-rank percentile. Sorts `values` in place; 0.0 when empty.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = ((p / 100.0) * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}
