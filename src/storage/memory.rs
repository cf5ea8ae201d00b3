//! In-memory `ColdLog`
//!
//! Same closure and idempotency rules as the SQLite store, no durability.
//! `set_failing` turns every append into a transient failure until cleared.

use anyhow::Result;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use super::ColdLog;
use crate::calendar::{PartitionCalendar, PartitionKey};
use crate::error::StoreError;
use crate::models::PredictionRecord;

#[derive(Default)]
struct MemoryInner {
    partitions: BTreeMap<PartitionKey, Vec<PredictionRecord>>,
    keys: HashMap<String, Vec<i64>>,
}

pub struct MemoryLog {
    calendar: Arc<dyn PartitionCalendar>,
    inner: RwLock<MemoryInner>,
    failing: AtomicBool,
    failed_appends: AtomicU64,
}

impl MemoryLog {
    pub fn new(calendar: Arc<dyn PartitionCalendar>) -> Self {
        Self {
            calendar,
            inner: RwLock::new(MemoryInner::default()),
            failing: AtomicBool::new(false),
            failed_appends: AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed_appends(&self) -> u64 {
        self.failed_appends.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ColdLog for MemoryLog {
    fn partition_for(&self, ts: i64) -> PartitionKey {
        self.calendar.partition_for(ts)
    }

    fn append(&self, record: &PredictionRecord) -> Result<PartitionKey, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_appends.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Transient(anyhow::anyhow!("injected append failure")));
        }

        let key = self.calendar.partition_for(record.ts);
        let mut inner = self.inner.write();
        if let Some((head, _)) = inner.partitions.last_key_value() {
            if key < *head {
                return Err(StoreError::PartitionClosed(key));
            }
        }

        let keys = inner.keys.entry(record.gid.clone()).or_default();
        match keys.binary_search(&record.ts) {
            Ok(_) => {
                return Err(StoreError::DuplicateKey {
                    gid: record.gid.clone(),
                    ts: record.ts,
                })
            }
            Err(pos) => keys.insert(pos, record.ts),
        }
        inner.partitions.entry(key).or_default().push(record.clone());
        Ok(key)
    }

    fn exists(&self, gid: &str, ts: i64) -> bool {
        self.inner
            .read()
            .keys
            .get(gid)
            .is_some_and(|keys| keys.binary_search(&ts).is_ok())
    }

    fn last_ts(&self, gid: &str) -> Option<i64> {
        self.inner.read().keys.get(gid).and_then(|k| k.last().copied())
    }

    fn head(&self) -> Option<PartitionKey> {
        self.inner.read().partitions.keys().next_back().copied()
    }

    fn partitions(&self) -> Vec<PartitionKey> {
        self.inner.read().partitions.keys().copied().collect()
    }

    fn read_partition(&self, key: PartitionKey) -> Result<Vec<PredictionRecord>> {
        Ok(self
            .inner
            .read()
            .partitions
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn read_game(&self, gid: &str) -> Result<Vec<PredictionRecord>> {
        Ok(self
            .inner
            .read()
            .partitions
            .values()
            .flatten()
            .filter(|r| r.gid == gid)
            .cloned()
            .collect())
    }
}
