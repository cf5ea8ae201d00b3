//! Partitioned SQLite cold store
//!
//! One database file per `(season, week)` partition, laid out as
//! `<root>/season=<s>/week=<ww>.db`. Within a partition rows are ordered by an
//! autoincrement sequence (acceptance order) and `UNIQUE(gid, ts)` backs the
//! durable existence index. An in-memory `(gid -> sorted ts)` index mirrors it
//! so idempotency checks never touch disk.

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

use super::ColdLog;
use crate::calendar::{PartitionCalendar, PartitionKey};
use crate::error::StoreError;
use crate::models::{Features, PredictionRecord};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS predictions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL,
    ts INTEGER NOT NULL,
    raw_p_win REAL NOT NULL,
    features_json TEXT NOT NULL,
    play_id TEXT,
    description TEXT,
    accepted_at INTEGER NOT NULL,
    UNIQUE (gid, ts)
);
"#;

struct WriterState {
    /// Newest partition that has received a write; everything older is closed.
    head: Option<PartitionKey>,
    /// Connection to the head partition.
    conn: Option<(PartitionKey, Connection)>,
    known: BTreeSet<PartitionKey>,
}

pub struct ColdStore {
    root: PathBuf,
    calendar: Arc<dyn PartitionCalendar>,
    writer: Mutex<WriterState>,
    index: RwLock<HashMap<String, Vec<i64>>>,
}

impl ColdStore {
    /// Open (or create) the store at `root`, rebuilding the key index from disk.
    pub fn open(root: impl AsRef<Path>, calendar: Arc<dyn PartitionCalendar>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cold store root {}", root.display()))?;

        let known = scan_partitions(&root)?;
        let mut index: HashMap<String, Vec<i64>> = HashMap::new();
        let mut rows = 0usize;
        for key in &known {
            let conn = open_read_only(&root, *key)?;
            let mut stmt = conn.prepare("SELECT gid, ts FROM predictions ORDER BY seq")?;
            let iter = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for item in iter {
                let (gid, ts) = item?;
                insert_sorted(index.entry(gid).or_default(), ts);
                rows += 1;
            }
        }

        let head = known.iter().next_back().copied();
        info!(
            "🧊 Cold store opened at {} ({} partitions, {} records, head={})",
            root.display(),
            known.len(),
            rows,
            head.map(|k| k.to_string()).unwrap_or_else(|| "none".to_string())
        );

        Ok(Self {
            root,
            calendar,
            writer: Mutex::new(WriterState {
                head,
                conn: None,
                known,
            }),
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_path(&self, key: PartitionKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn open_writer(&self, key: PartitionKey) -> Result<Connection> {
        let path = self.partition_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create partition dir {}", parent.display()))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)
            .with_context(|| format!("Failed to open partition {}", path.display()))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize partition schema")?;
        debug!(partition = %key, "Opened partition for writing");
        Ok(conn)
    }
}

impl ColdLog for ColdStore {
    fn partition_for(&self, ts: i64) -> PartitionKey {
        self.calendar.partition_for(ts)
    }

    fn append(&self, record: &PredictionRecord) -> Result<PartitionKey, StoreError> {
        let key = self.calendar.partition_for(record.ts);
        let features_json = serde_json::to_string(&record.features)
            .map_err(|e| StoreError::Transient(e.into()))?;

        let mut writer = self.writer.lock();
        if let Some(head) = writer.head {
            if key < head {
                return Err(StoreError::PartitionClosed(key));
            }
        }

        let reopen = !matches!(&writer.conn, Some((open_key, _)) if *open_key == key);
        if reopen {
            let conn = self.open_writer(key).map_err(StoreError::Transient)?;
            if let Some((previous, _)) = writer.conn.replace((key, conn)) {
                info!(closed = %previous, opened = %key, "📦 Partition rolled over");
            }
        }
        let Some((_, conn)) = writer.conn.as_ref() else {
            return Err(StoreError::Transient(anyhow::anyhow!("partition writer unavailable")));
        };

        let inserted = conn.execute(
            "INSERT INTO predictions (gid, ts, raw_p_win, features_json, play_id, description, accepted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &record.gid,
                record.ts,
                record.raw_p_win,
                &features_json,
                &record.play_id,
                &record.description,
                chrono::Utc::now().timestamp_millis(),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateKey {
                    gid: record.gid.clone(),
                    ts: record.ts,
                });
            }
            Err(e) => {
                // Force a fresh connection on the next attempt.
                writer.conn = None;
                return Err(e.into());
            }
        }

        writer.head = Some(writer.head.map_or(key, |h| h.max(key)));
        writer.known.insert(key);
        insert_sorted(
            self.index.write().entry(record.gid.clone()).or_default(),
            record.ts,
        );
        Ok(key)
    }

    fn exists(&self, gid: &str, ts: i64) -> bool {
        self.index
            .read()
            .get(gid)
            .is_some_and(|keys| keys.binary_search(&ts).is_ok())
    }

    fn last_ts(&self, gid: &str) -> Option<i64> {
        self.index.read().get(gid).and_then(|keys| keys.last().copied())
    }

    fn head(&self) -> Option<PartitionKey> {
        self.writer.lock().head
    }

    fn partitions(&self) -> Vec<PartitionKey> {
        self.writer.lock().known.iter().copied().collect()
    }

    fn read_partition(&self, key: PartitionKey) -> Result<Vec<PredictionRecord>> {
        if !self.writer.lock().known.contains(&key) {
            return Ok(Vec::new());
        }
        let conn = open_read_only(&self.root, key)?;
        let mut stmt = conn.prepare(
            "SELECT gid, ts, raw_p_win, features_json, play_id, description
             FROM predictions ORDER BY seq",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read partition {}", key))
    }

    fn read_game(&self, gid: &str) -> Result<Vec<PredictionRecord>> {
        if !self.index.read().contains_key(gid) {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for key in self.partitions() {
            let conn = open_read_only(&self.root, key)?;
            let mut stmt = conn.prepare_cached(
                "SELECT gid, ts, raw_p_win, features_json, play_id, description
                 FROM predictions WHERE gid = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![gid], row_to_record)?;
            for row in rows {
                records.push(row?);
            }
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PredictionRecord> {
    let features_json: String = row.get(3)?;
    let features: Features = serde_json::from_str(&features_json).unwrap_or_else(|e| {
        warn!("Corrupt features_json in cold store: {}", e);
        Features::new()
    });
    Ok(PredictionRecord {
        gid: row.get(0)?,
        ts: row.get(1)?,
        raw_p_win: row.get(2)?,
        features,
        play_id: row.get(4)?,
        description: row.get(5)?,
    })
}

fn open_read_only(root: &Path, key: PartitionKey) -> Result<Connection> {
    let path = root.join(key.relative_path());
    Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("Failed to open partition {} read-only", path.display()))
}

fn scan_partitions(root: &Path) -> Result<BTreeSet<PartitionKey>> {
    let mut known = BTreeSet::new();
    for season in fs::read_dir(root)? {
        let season = season?;
        if !season.file_type()?.is_dir() {
            continue;
        }
        let season_name = season.file_name().to_string_lossy().to_string();
        for week in fs::read_dir(season.path())? {
            let week = week?;
            let week_name = week.file_name().to_string_lossy().to_string();
            if let Some(key) = PartitionKey::parse(&season_name, &week_name) {
                known.insert(key);
            }
        }
    }
    Ok(known)
}

fn insert_sorted(keys: &mut Vec<i64>, ts: i64) {
    match keys.last() {
        Some(&last) if last < ts => keys.push(ts),
        None => keys.push(ts),
        _ => {
            if let Err(pos) = keys.binary_search(&ts) {
                keys.insert(pos, ts);
            }
        }
    }
}
