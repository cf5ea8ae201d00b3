//! Durable writer
//!
//! Sits in front of a `ColdLog`. Each record gets one synchronous append
//! attempt; on a transient failure it is parked in a bounded FIFO retry buffer
//! and a background drainer retries with exponential backoff. Once anything is
//! buffered, later records queue behind it so acceptance order is preserved.
//!
//! Escalation is broadcast as `PipelineSignal`s. Overflowing the buffer drops
//! the oldest record and is reported as data loss.

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

use super::ColdLog;
use crate::calendar::PartitionKey;
use crate::error::StoreError;
use crate::models::PredictionRecord;

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PipelineSignal {
    /// Retries exhausted; records are being held in the retry buffer.
    Degraded { pending: usize, error: String },
    /// Retry buffer fully drained.
    Recovered,
    /// A buffered record was evicted before it could be persisted.
    DataLoss { gid: String, ts: i64 },
}

/// Why the writer refused a record outright. Transient failures never surface
/// here; they are buffered instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRejection {
    PartitionClosed(PartitionKey),
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted(PartitionKey),
    /// Held in the retry buffer; will be persisted by the drainer.
    Buffered,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriterStats {
    pub persisted: u64,
    pub buffered: u64,
    pub retries: u64,
    pub dropped: u64,
    pub pending: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub buffer_capacity: usize,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(self.max_attempts).min(16);
        self.base_delay.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
    }
}

struct WriterState {
    /// Newest partition admitted, persisted or buffered.
    head: Option<PartitionKey>,
    pending: VecDeque<PredictionRecord>,
    pending_keys: HashSet<(String, i64)>,
}

impl WriterState {
    fn admit(&mut self, key: PartitionKey) {
        self.head = Some(self.head.map_or(key, |h| h.max(key)));
    }

    fn pop_front(&mut self) -> Option<PredictionRecord> {
        let record = self.pending.pop_front()?;
        self.pending_keys.remove(&(record.gid.clone(), record.ts));
        Some(record)
    }
}

pub struct DurableWriter {
    cold: Arc<dyn ColdLog>,
    policy: RetryPolicy,
    state: Mutex<WriterState>,
    notify: Notify,
    signals: broadcast::Sender<PipelineSignal>,
    degraded: AtomicBool,
    persisted: AtomicU64,
    buffered: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

impl DurableWriter {
    pub fn new(cold: Arc<dyn ColdLog>, policy: RetryPolicy) -> Self {
        let (signals, _) = broadcast::channel(64);
        let head = cold.head();
        Self {
            cold,
            policy,
            state: Mutex::new(WriterState {
                head,
                pending: VecDeque::new(),
                pending_keys: HashSet::new(),
            }),
            notify: Notify::new(),
            signals,
            degraded: AtomicBool::new(false),
            persisted: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn cold(&self) -> &Arc<dyn ColdLog> {
        &self.cold
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineSignal> {
        self.signals.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn partition_for(&self, ts: i64) -> PartitionKey {
        self.cold.partition_for(ts)
    }

    /// Whether `key` lies before the newest admitted partition.
    pub fn is_closed(&self, key: PartitionKey) -> bool {
        self.state.lock().head.is_some_and(|head| key < head)
    }

    /// Known key, either persisted or waiting in the retry buffer.
    pub fn exists(&self, gid: &str, ts: i64) -> bool {
        if self.cold.exists(gid, ts) {
            return true;
        }
        let state = self.state.lock();
        !state.pending_keys.is_empty() && state.pending_keys.contains(&(gid.to_string(), ts))
    }

    pub fn last_ts(&self, gid: &str) -> Option<i64> {
        let persisted = self.cold.last_ts(gid);
        let state = self.state.lock();
        let buffered = state
            .pending
            .iter()
            .filter(|r| r.gid == gid)
            .map(|r| r.ts)
            .max();
        persisted.max(buffered)
    }

    /// Persist `record`, or park it for retry after a transient failure.
    ///
    /// The state lock only covers bookkeeping; the cold append runs outside
    /// it so a slow disk write for one game never holds up another. Callers
    /// serialize writes per game.
    pub fn write(&self, record: &PredictionRecord) -> Result<WriteOutcome, WriteRejection> {
        let key = self.cold.partition_for(record.ts);
        {
            let state = self.state.lock();
            if state.head.is_some_and(|head| key < head) {
                return Err(WriteRejection::PartitionClosed(key));
            }
            if !state.pending_keys.is_empty()
                && state.pending_keys.contains(&(record.gid.clone(), record.ts))
            {
                return Err(WriteRejection::Duplicate);
            }
            if !state.pending.is_empty() {
                // Queue behind what is already buffered.
                return Ok(self.park(state, key, record));
            }
        }

        match self.cold.append(record) {
            Ok(key) => {
                self.state.lock().admit(key);
                self.persisted.fetch_add(1, Ordering::Relaxed);
                Ok(WriteOutcome::Persisted(key))
            }
            Err(StoreError::Transient(e)) => {
                warn!(gid = %record.gid, ts = record.ts, "Cold store append failed, buffering for retry: {:#}", e);
                Ok(self.park(self.state.lock(), key, record))
            }
            Err(StoreError::PartitionClosed(key)) => Err(WriteRejection::PartitionClosed(key)),
            Err(StoreError::DuplicateKey { .. }) => Err(WriteRejection::Duplicate),
        }
    }

    fn park(
        &self,
        mut state: MutexGuard<'_, WriterState>,
        key: PartitionKey,
        record: &PredictionRecord,
    ) -> WriteOutcome {
        state.admit(key);
        if state.pending.len() >= self.policy.buffer_capacity {
            if let Some(evicted) = state.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    gid = %evicted.gid,
                    ts = evicted.ts,
                    capacity = self.policy.buffer_capacity,
                    "🚨 Retry buffer full, dropping oldest unpersisted record"
                );
                let _ = self.signals.send(PipelineSignal::DataLoss {
                    gid: evicted.gid,
                    ts: evicted.ts,
                });
            }
        }
        state
            .pending_keys
            .insert((record.gid.clone(), record.ts));
        state.pending.push_back(record.clone());
        drop(state);

        self.buffered.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        WriteOutcome::Buffered
    }

    /// Background task draining the retry buffer. Runs until the process exits.
    pub async fn run_drainer(self: Arc<Self>) {
        info!("🔁 Durable writer drainer started");
        loop {
            self.notify.notified().await;
            self.drain().await;
        }
    }

    /// Retry buffered records in order until the buffer is empty.
    pub async fn drain(&self) {
        let mut attempt: u32 = 0;
        loop {
            let Some(record) = self.state.lock().pending.front().cloned() else {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("✅ Retry buffer drained, pipeline recovered");
                    let _ = self.signals.send(PipelineSignal::Recovered);
                }
                return;
            };

            let result = self.cold.append(&record);
            let failure = {
                let mut state = self.state.lock();
                // Overflow may have evicted the record while it was in flight.
                let in_front = state
                    .pending
                    .front()
                    .is_some_and(|r| r.gid == record.gid && r.ts == record.ts);
                match result {
                    Ok(_) => {
                        if in_front {
                            state.pop_front();
                        }
                        self.persisted.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Err(StoreError::DuplicateKey { .. }) => {
                        // An earlier attempt landed before reporting failure.
                        if in_front {
                            state.pop_front();
                        }
                        None
                    }
                    Err(StoreError::PartitionClosed(_)) if !in_front => None,
                    Err(StoreError::PartitionClosed(key)) => {
                        state.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        error!(gid = %record.gid, ts = record.ts, partition = %key, "🚨 Buffered record landed in a closed partition, dropping");
                        let _ = self.signals.send(PipelineSignal::DataLoss {
                            gid: record.gid,
                            ts: record.ts,
                        });
                        None
                    }
                    Err(StoreError::Transient(e)) => Some((format!("{:#}", e), state.pending.len())),
                }
            };

            let Some((err, pending)) = failure else {
                attempt = 0;
                continue;
            };

            attempt += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            if attempt >= self.policy.max_attempts && !self.degraded.swap(true, Ordering::SeqCst) {
                error!(pending, attempts = attempt, "⚠️ Cold store retries exhausted, pipeline degraded: {}", err);
                let _ = self.signals.send(PipelineSignal::Degraded { pending, error: err });
            } else {
                debug!(pending, attempt, "Cold store retry failed: {}", err);
            }
            tokio::time::sleep(self.policy.backoff(attempt)).await;
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.pending(),
            degraded: self.is_degraded(),
        }
    }
}
