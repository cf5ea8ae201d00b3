//! Timestamp → `(season, week)` partition mapping.
//!
//! The calendar rule is injected; the engine never assumes a specific league
//! schedule. `WeeklyCalendar` is the configurable default.

use serde::{Deserialize, Serialize};
use std::fmt;

const WEEK_MS: i64 = 7 * 24 * 3600 * 1000;

/// Address of a cold-store partition. Orders by season, then week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub season: i32,
    pub week: u32,
}

impl PartitionKey {
    pub fn new(season: i32, week: u32) -> Self {
        Self { season, week }
    }

    /// Relative path of the partition file under the data directory.
    pub fn relative_path(&self) -> String {
        format!("season={}/week={:02}.db", self.season, self.week)
    }

    /// Inverse of `relative_path` for the `season=<s>` dir and `week=<w>.db` file names.
    pub fn parse(season_dir: &str, week_file: &str) -> Option<Self> {
        let season = season_dir.strip_prefix("season=")?.parse().ok()?;
        let week = week_file
            .strip_prefix("week=")?
            .strip_suffix(".db")?
            .parse()
            .ok()?;
        Some(Self { season, week })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/w{:02}", self.season, self.week)
    }
}

/// Maps a record timestamp (ms) to its partition.
pub trait PartitionCalendar: Send + Sync {
    fn partition_for(&self, ts_ms: i64) -> PartitionKey;
}

impl<F> PartitionCalendar for F
where
    F: Fn(i64) -> PartitionKey + Send + Sync,
{
    fn partition_for(&self, ts_ms: i64) -> PartitionKey {
        self(ts_ms)
    }
}

/// Fixed-length seasons of 7-day weeks counted from an epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeeklyCalendar {
    pub epoch_ms: i64,
    pub first_season: i32,
    pub weeks_per_season: u32,
}

impl Default for WeeklyCalendar {
    fn default() -> Self {
        Self {
            epoch_ms: 0,
            first_season: 1970,
            weeks_per_season: 52,
        }
    }
}

impl PartitionCalendar for WeeklyCalendar {
    fn partition_for(&self, ts_ms: i64) -> PartitionKey {
        let weeks_per_season = self.weeks_per_season.max(1) as i64;
        let week_index = (ts_ms - self.epoch_ms).div_euclid(WEEK_MS);
        let season = self.first_season as i64 + week_index.div_euclid(weeks_per_season);
        let week = week_index.rem_euclid(weeks_per_season) + 1;
        PartitionKey::new(season as i32, week as u32)
    }
}
