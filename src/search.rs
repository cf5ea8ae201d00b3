//! Play search
//!
//! Append-only index of accepted records. Queries are case-insensitive
//! substring matches over each entry's searchable text, newest first.

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use crate::models::{PredictionRecord, SearchEntry};
use crate::storage::ColdLog;

struct IndexedEntry {
    entry: SearchEntry,
    lowered: String,
}

#[derive(Default)]
pub struct SearchIndex {
    entries: RwLock<Vec<IndexedEntry>>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: &PredictionRecord) {
        let searchable_text = record.searchable_text();
        let lowered = searchable_text.to_lowercase();
        self.entries.write().push(IndexedEntry {
            entry: SearchEntry {
                gid: record.gid.clone(),
                ts: record.ts,
                searchable_text,
            },
            lowered,
        });
    }

    /// Case-insensitive substring match, ordered by descending `ts`. Blank
    /// queries match nothing.
    pub fn search(&self, query: &str) -> Vec<SearchEntry> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let mut hits: Vec<SearchEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.lowered.contains(&needle))
            .map(|e| e.entry.clone())
            .collect();
        hits.sort_by(|a, b| b.ts.cmp(&a.ts).then_with(|| a.gid.cmp(&b.gid)));
        hits
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index everything already in the cold store.
    pub fn backfill(&self, cold: &dyn ColdLog) -> Result<usize> {
        let mut count = 0;
        for key in cold.partitions() {
            for record in cold.read_partition(key)? {
                self.append(&record);
                count += 1;
            }
        }
        if count > 0 {
            info!("🔎 Search index backfilled with {} records", count);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match_newest_first() {
        let index = SearchIndex::new();
        index.append(&PredictionRecord::new("G1", 1_000, 0.5).with_play("p1", "Run up the middle"));
        index.append(&PredictionRecord::new("G1", 3_000, 0.5).with_play("p3", "Pass into the Red Zone"));
        index.append(&PredictionRecord::new("G2", 2_000, 0.5).with_play("p2", "red zone fade"));

        let hits = index.search("RED");
        let ts: Vec<i64> = hits.iter().map(|h| h.ts).collect();
        assert_eq!(ts, vec![3_000, 2_000]);
        assert!(hits[0].searchable_text.contains("Red Zone"));

        assert!(index.search("blue").is_empty());
        assert!(index.search("   ").is_empty());
    }

    #[test]
    fn test_matches_gid() {
        let index = SearchIndex::new();
        index.append(&PredictionRecord::new("KC-BUF-2024", 1, 0.5));
        assert_eq!(index.search("buf").len(), 1);
    }
}
