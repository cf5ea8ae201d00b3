//! Durable persistence
//!
//! - `cold`: partitioned SQLite log, the source of truth for every accepted record
//! - `memory`: in-process `ColdLog` used for ephemeral runs and failure injection
//! - `writer`: retrying writer in front of any `ColdLog`, owns the retry buffer

pub mod cold;
pub mod memory;
pub mod writer;

pub use cold::ColdStore;
pub use memory::MemoryLog;
pub use writer::{DurableWriter, PipelineSignal, RetryPolicy, WriteOutcome, WriteRejection, WriterStats};

use anyhow::Result;

use crate::calendar::PartitionKey;
use crate::error::StoreError;
use crate::models::PredictionRecord;

/// Append-only, time-partitioned record log.
///
/// Appends into a partition older than the newest written one must fail with
/// `StoreError::PartitionClosed`; an existing `(gid, ts)` with `DuplicateKey`.
pub trait ColdLog: Send + Sync {
    fn partition_for(&self, ts: i64) -> PartitionKey;

    fn append(&self, record: &PredictionRecord) -> Result<PartitionKey, StoreError>;

    fn exists(&self, gid: &str, ts: i64) -> bool;

    fn last_ts(&self, gid: &str) -> Option<i64>;

    /// Newest partition that has received a write.
    fn head(&self) -> Option<PartitionKey>;

    /// All partitions with data, ascending.
    fn partitions(&self) -> Vec<PartitionKey>;

    /// Records of one partition in acceptance order.
    fn read_partition(&self, key: PartitionKey) -> Result<Vec<PredictionRecord>>;

    /// One game's records across partitions, oldest first.
    fn read_game(&self, gid: &str) -> Result<Vec<PredictionRecord>>;
}
