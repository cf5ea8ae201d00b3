//! Engine configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `WINPROB_*` environment variables. CLI flags in `main.rs` apply last.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calendar::WeeklyCalendar;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,

    /// Smoothing factor in (0, 1].
    pub alpha: f64,
    /// Rolling importance window length per game.
    pub window_size: usize,

    pub cache_ttl_secs: u64,
    pub subscriber_buffer: usize,
    pub connection_buffer: usize,

    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_buffer_capacity: usize,

    pub replay_min_delay_ms: u64,
    pub replay_grace_ms: u64,
    pub replay_feed_capacity: usize,

    pub drift_window: usize,
    pub drift_threshold: f64,
    pub drift_queue_capacity: usize,

    pub metrics_ring_capacity: usize,
    pub latency_bound_ms: f64,

    pub calendar: WeeklyCalendar,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("data"),
            alpha: 0.15,
            window_size: 32,
            cache_ttl_secs: 48 * 3600,
            subscriber_buffer: 256,
            connection_buffer: 1024,
            retry_max_attempts: 5,
            retry_base_delay_ms: 20,
            retry_buffer_capacity: 10_000,
            replay_min_delay_ms: 5,
            replay_grace_ms: 30_000,
            replay_feed_capacity: 1024,
            drift_window: 20,
            drift_threshold: 0.15,
            drift_queue_capacity: 4096,
            metrics_ring_capacity: 8192,
            latency_bound_ms: 300.0,
            calendar: WeeklyCalendar::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Defaults or `path` (falling back to `WINPROB_CONFIG`), then env overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let from_env = env::var("WINPROB_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("WINPROB_BIND_ADDR") {
            if !v.trim().is_empty() {
                self.bind_addr = v;
            }
        }
        if let Ok(v) = env::var("WINPROB_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = PathBuf::from(v);
            }
        }
        override_parsed("WINPROB_ALPHA", &mut self.alpha);
        override_parsed("WINPROB_WINDOW_SIZE", &mut self.window_size);
        override_parsed("WINPROB_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        override_parsed("WINPROB_SUBSCRIBER_BUFFER", &mut self.subscriber_buffer);
        override_parsed("WINPROB_CONNECTION_BUFFER", &mut self.connection_buffer);
        override_parsed("WINPROB_RETRY_MAX_ATTEMPTS", &mut self.retry_max_attempts);
        override_parsed("WINPROB_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms);
        override_parsed("WINPROB_RETRY_BUFFER_CAPACITY", &mut self.retry_buffer_capacity);
        override_parsed("WINPROB_REPLAY_MIN_DELAY_MS", &mut self.replay_min_delay_ms);
        override_parsed("WINPROB_REPLAY_GRACE_MS", &mut self.replay_grace_ms);
        override_parsed("WINPROB_DRIFT_WINDOW", &mut self.drift_window);
        override_parsed("WINPROB_DRIFT_THRESHOLD", &mut self.drift_threshold);
        override_parsed("WINPROB_LATENCY_BOUND_MS", &mut self.latency_bound_ms);
        override_parsed("WINPROB_SEASON_EPOCH_MS", &mut self.calendar.epoch_ms);
        override_parsed("WINPROB_FIRST_SEASON", &mut self.calendar.first_season);
        override_parsed("WINPROB_WEEKS_PER_SEASON", &mut self.calendar.weeks_per_season);
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            bail!("alpha must be in (0, 1], got {}", self.alpha);
        }
        if self.window_size == 0 {
            bail!("window_size must be at least 1");
        }
        if self.subscriber_buffer == 0 || self.connection_buffer == 0 {
            bail!("subscriber_buffer and connection_buffer must be non-zero");
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        if self.retry_buffer_capacity == 0 {
            bail!("retry_buffer_capacity must be at least 1");
        }
        if self.replay_feed_capacity == 0 {
            bail!("replay_feed_capacity must be at least 1");
        }
        if self.calendar.weeks_per_season == 0 {
            bail!("calendar.weeks_per_season must be at least 1");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn replay_min_delay(&self) -> Duration {
        Duration::from_millis(self.replay_min_delay_ms)
    }

    pub fn replay_grace(&self) -> Duration {
        Duration::from_millis(self.replay_grace_ms)
    }

    pub fn retrain_log_path(&self) -> PathBuf {
        self.data_dir.join("retrain_requests.log")
    }
}

fn override_parsed<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Some(v) = env::var(var).ok().and_then(|v| v.trim().parse::<T>().ok()) {
        *target = v;
    }
}
