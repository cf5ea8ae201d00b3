//! Ingestion pipeline
//!
//! `ingest` is synchronous and fails fast. Each game has its own lane lock, so
//! validation, idempotency, ordering and the write for one game are a single
//! critical section while different games proceed in parallel.
//!
//! Check order for a record:
//! 1. malformed (empty gid, non-positive ts, p_win outside [0, 1])
//! 2. duplicate `(gid, ts)` against the durable index, no side effects
//! 3. out of order (`ts <= last accepted ts`)
//! 4. partition closed
//!
//! Accepted records go to the durable writer, then through the smoother into
//! the hot cache, the search index and the drift agent.

use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tracing::{debug, trace, warn};

use crate::cache::HotCache;
use crate::drift::{DriftAgent, DriftObservation};
use crate::error::{IngestOutcome, RejectReason};
use crate::metrics::PipelineMetrics;
use crate::models::{PredictionRecord, Snapshot};
use crate::search::SearchIndex;
use crate::smoother::MetaModel;
use crate::storage::{DurableWriter, WriteOutcome, WriteRejection};

#[derive(Debug, Default)]
struct GameLane {
    restored: bool,
    last_ts: Option<i64>,
}

pub struct IngestPipeline {
    writer: Arc<DurableWriter>,
    model: Arc<MetaModel>,
    cache: Arc<HotCache>,
    search: Arc<SearchIndex>,
    drift: DriftAgent,
    metrics: Arc<PipelineMetrics>,
    lanes: RwLock<HashMap<String, Arc<Mutex<GameLane>>>>,
}

/// Structural checks that need no state.
pub fn validate(record: &PredictionRecord) -> Result<(), RejectReason> {
    if record.gid.trim().is_empty() || record.ts <= 0 {
        return Err(RejectReason::Malformed);
    }
    if !record.raw_p_win.is_finite() || !(0.0..=1.0).contains(&record.raw_p_win) {
        return Err(RejectReason::Malformed);
    }
    Ok(())
}

impl IngestPipeline {
    pub fn new(
        writer: Arc<DurableWriter>,
        model: Arc<MetaModel>,
        cache: Arc<HotCache>,
        search: Arc<SearchIndex>,
        drift: DriftAgent,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            writer,
            model,
            cache,
            search,
            drift,
            metrics,
            lanes: RwLock::new(HashMap::new()),
        }
    }

    pub fn writer(&self) -> &Arc<DurableWriter> {
        &self.writer
    }

    pub fn model(&self) -> &Arc<MetaModel> {
        &self.model
    }

    pub fn cache(&self) -> &Arc<HotCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    fn lane(&self, gid: &str) -> Arc<Mutex<GameLane>> {
        if let Some(lane) = self.lanes.read().get(gid) {
            return lane.clone();
        }
        self.lanes
            .write()
            .entry(gid.to_string())
            .or_default()
            .clone()
    }

    pub fn ingest(&self, record: PredictionRecord) -> IngestOutcome {
        let enqueued = Instant::now();
        if let Err(reason) = validate(&record) {
            debug!(gid = %record.gid, ts = record.ts, reason = %reason, "Rejected ingest");
            let outcome = IngestOutcome::Rejected(reason);
            self.metrics.record_outcome(&outcome);
            return outcome;
        }

        let _in_flight = self.metrics.enter(&record.gid);
        let lane = self.lane(&record.gid);
        let mut lane = lane.lock();
        if !lane.restored {
            self.restore(&record.gid, &mut lane);
        }

        let outcome = self.accept(&mut lane, &record, enqueued);
        self.metrics.record_outcome(&outcome);
        match &outcome {
            IngestOutcome::Accepted => {
                trace!(gid = %record.gid, ts = record.ts, "Accepted ingest")
            }
            IngestOutcome::Duplicate => {
                debug!(gid = %record.gid, ts = record.ts, "Duplicate ingest ignored")
            }
            IngestOutcome::Rejected(reason) => {
                debug!(gid = %record.gid, ts = record.ts, reason = %reason, "Rejected ingest")
            }
        }
        outcome
    }

    /// First touch of a game in this process: pick up its ordering watermark
    /// and smoother state from stored history.
    fn restore(&self, gid: &str, lane: &mut GameLane) {
        lane.restored = true;
        lane.last_ts = self.writer.last_ts(gid);
        if lane.last_ts.is_none() {
            return;
        }
        match self.writer.cold().read_game(gid) {
            Ok(history) => {
                self.model.warm(gid, &history);
                debug!(gid = %gid, records = history.len(), "Restored game state from cold store");
            }
            Err(e) => {
                warn!(gid = %gid, "Failed to restore smoother state, starting fresh: {:#}", e);
            }
        }
    }

    fn accept(&self, lane: &mut GameLane, record: &PredictionRecord, enqueued: Instant) -> IngestOutcome {
        if self.writer.exists(&record.gid, record.ts) {
            return IngestOutcome::Duplicate;
        }
        if lane.last_ts.is_some_and(|last| record.ts <= last) {
            return IngestOutcome::Rejected(RejectReason::OutOfOrder);
        }

        match self.writer.write(record) {
            Ok(WriteOutcome::Persisted(_)) => {}
            Ok(WriteOutcome::Buffered) => {
                debug!(gid = %record.gid, ts = record.ts, "Accepted with cold write pending retry");
            }
            Err(WriteRejection::PartitionClosed(key)) => {
                debug!(gid = %record.gid, ts = record.ts, partition = %key, "Late record for closed partition");
                return IngestOutcome::Rejected(RejectReason::PartitionClosed);
            }
            Err(WriteRejection::Duplicate) => return IngestOutcome::Duplicate,
        }
        lane.last_ts = Some(record.ts);

        let snapshot = self.model.update(record);
        self.publish(record, snapshot);
        self.metrics
            .record_latency(&record.gid, enqueued, Instant::now());
        IngestOutcome::Accepted
    }

    fn publish(&self, record: &PredictionRecord, snapshot: Snapshot) {
        self.drift.observe(DriftObservation {
            gid: record.gid.clone(),
            ts: record.ts,
            raw_p_win: record.raw_p_win,
            p_win: snapshot.p_win,
        });
        self.cache.put(snapshot);
        self.search.append(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::PartitionKey;
    use crate::storage::{MemoryLog, RetryPolicy};
    use std::time::Duration;

    struct Harness {
        log: Arc<MemoryLog>,
        pipeline: IngestPipeline,
    }

    fn harness(alpha: f64) -> Harness {
        let log = Arc::new(MemoryLog::new(Arc::new(|ts: i64| {
            PartitionKey::new(2024, (ts / 10_000) as u32 + 1)
        })));
        let writer = Arc::new(DurableWriter::new(
            log.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                buffer_capacity: 64,
            },
        ));
        let (drift, _rx) = DriftAgent::new(16);
        let pipeline = IngestPipeline::new(
            writer,
            Arc::new(MetaModel::new(alpha, 8)),
            Arc::new(HotCache::new(None, 16)),
            Arc::new(SearchIndex::new()),
            drift,
            Arc::new(PipelineMetrics::new(64, 300.0)),
        );
        Harness { log, pipeline }
    }

    #[test]
    fn test_malformed_records_rejected() {
        let h = harness(0.3);
        for record in [
            PredictionRecord::new("", 1, 0.5),
            PredictionRecord::new("G1", 0, 0.5),
            PredictionRecord::new("G1", -5, 0.5),
            PredictionRecord::new("G1", 1, f64::NAN),
            PredictionRecord::new("G1", 1, 1.5),
        ] {
            assert_eq!(
                h.pipeline.ingest(record),
                IngestOutcome::Rejected(RejectReason::Malformed)
            );
        }
        assert!(h.log.is_empty());
        assert_eq!(h.pipeline.metrics().snapshot().rejected_malformed, 5);
    }

    #[test]
    fn test_duplicate_is_noop_and_out_of_order_rejected() {
        let h = harness(0.3);
        assert_eq!(h.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.52)), IngestOutcome::Accepted);
        assert_eq!(h.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.60)), IngestOutcome::Accepted);

        assert_eq!(h.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.99)), IngestOutcome::Duplicate);
        assert_eq!(
            h.pipeline.ingest(PredictionRecord::new("G1", 1_500, 0.5)),
            IngestOutcome::Rejected(RejectReason::OutOfOrder)
        );

        assert_eq!(h.log.len(), 2);
        let snapshot = h.pipeline.cache().get("G1").unwrap();
        assert_eq!(snapshot.ts, 2_000);
        assert!((snapshot.p_win - 0.544).abs() < 1e-12);
    }

    #[test]
    fn test_late_record_for_closed_partition() {
        let h = harness(0.3);
        h.pipeline.ingest(PredictionRecord::new("G1", 5_000, 0.5));
        h.pipeline.ingest(PredictionRecord::new("G2", 15_000, 0.5));
        assert_eq!(
            h.pipeline.ingest(PredictionRecord::new("G3", 6_000, 0.5)),
            IngestOutcome::Rejected(RejectReason::PartitionClosed)
        );
    }

    #[test]
    fn test_store_outage_still_updates_cache() {
        let h = harness(0.5);
        h.log.set_failing(true);
        assert_eq!(h.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.4)), IngestOutcome::Accepted);
        assert!(h.pipeline.cache().get("G1").is_some());
        assert_eq!(h.pipeline.writer().pending(), 1);

        // Buffered key still counts for idempotency.
        assert_eq!(h.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.4)), IngestOutcome::Duplicate);
    }

    #[test]
    fn test_restores_watermark_and_smoother_from_history() {
        let h = harness(0.3);
        h.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.52));

        // A fresh pipeline over the same log behaves as if it never restarted.
        let writer = Arc::new(DurableWriter::new(
            h.log.clone(),
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                buffer_capacity: 8,
            },
        ));
        let (drift, _rx) = DriftAgent::new(4);
        let restarted = IngestPipeline::new(
            writer,
            Arc::new(MetaModel::new(0.3, 8)),
            Arc::new(HotCache::new(None, 4)),
            Arc::new(SearchIndex::new()),
            drift,
            Arc::new(PipelineMetrics::new(8, 300.0)),
        );

        assert_eq!(
            restarted.ingest(PredictionRecord::new("G1", 500, 0.5)),
            IngestOutcome::Rejected(RejectReason::OutOfOrder)
        );
        assert_eq!(restarted.ingest(PredictionRecord::new("G1", 2_000, 0.60)), IngestOutcome::Accepted);
        let snapshot = restarted.cache().get("G1").unwrap();
        assert!((snapshot.p_win - 0.544).abs() < 1e-12);
    }
}
