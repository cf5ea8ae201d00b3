//! Engine wiring
//!
//! Builds every component from an `EngineConfig`, shares them behind `Arc`s
//! and owns the background tasks: retry drainer, cache TTL sweeper, drift
//! agent and retrain logger. Dropping the engine aborts those tasks.

use anyhow::{Context, Result};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::HotCache;
use crate::config::EngineConfig;
use crate::drift::{DriftAgent, DriftMonitor, RetrainLogger};
use crate::metrics::PipelineMetrics;
use crate::models::{HistoryPoint, HistoryResponse, PredictionRecord, TopBucket, TopBucketsResponse};
use crate::pipeline::IngestPipeline;
use crate::replay::ReplayEngine;
use crate::search::SearchIndex;
use crate::smoother::MetaModel;
use crate::storage::{ColdLog, ColdStore, DurableWriter, RetryPolicy};

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Engine {
    pub config: EngineConfig,
    pub cold: Arc<dyn ColdLog>,
    pub writer: Arc<DurableWriter>,
    pub model: Arc<MetaModel>,
    pub cache: Arc<HotCache>,
    pub search: Arc<SearchIndex>,
    pub metrics: Arc<PipelineMetrics>,
    pub drift: DriftAgent,
    pub pipeline: Arc<IngestPipeline>,
    pub replay: Arc<ReplayEngine>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Open the partitioned SQLite store under `config.data_dir` and start.
    /// Must be called inside a tokio runtime.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("Failed to create data dir {}", config.data_dir.display())
        })?;
        let cold = ColdStore::open(&config.data_dir, Arc::new(config.calendar.clone()))
            .context("Failed to open cold store")?;
        info!("💾 Cold store opened at {}", cold.root().display());
        Self::with_cold(config, Arc::new(cold))
    }

    /// Start over any `ColdLog` implementation.
    pub fn with_cold(config: EngineConfig, cold: Arc<dyn ColdLog>) -> Result<Self> {
        config.validate()?;

        let writer = Arc::new(DurableWriter::new(
            cold.clone(),
            RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: config.retry_base_delay(),
                buffer_capacity: config.retry_buffer_capacity,
            },
        ));
        let model = Arc::new(MetaModel::new(config.alpha, config.window_size));
        let cache = Arc::new(HotCache::new(config.cache_ttl(), config.subscriber_buffer));
        let search = Arc::new(SearchIndex::new());
        search
            .backfill(cold.as_ref())
            .context("Failed to backfill search index")?;
        let metrics = Arc::new(PipelineMetrics::new(
            config.metrics_ring_capacity,
            config.latency_bound_ms,
        ));
        let (drift, drift_rx) = DriftAgent::new(config.drift_queue_capacity);

        let pipeline = Arc::new(IngestPipeline::new(
            writer.clone(),
            model.clone(),
            cache.clone(),
            search.clone(),
            drift.clone(),
            metrics.clone(),
        ));
        let replay = Arc::new(ReplayEngine::new(
            cold.clone(),
            model.clone(),
            cache.clone(),
            config.replay_min_delay(),
            config.replay_grace(),
            config.replay_feed_capacity,
        ));

        let mut tasks = vec![
            tokio::spawn(writer.clone().run_drainer()),
            tokio::spawn(RetrainLogger::new(config.retrain_log_path()).run(drift.subscribe())),
            tokio::spawn(
                drift
                    .clone()
                    .run(drift_rx, DriftMonitor::new(config.drift_window, config.drift_threshold)),
            ),
        ];
        if let Some(ttl) = config.cache_ttl() {
            tasks.push(tokio::spawn(
                cache.clone().run_sweeper(ttl.min(MAX_SWEEP_INTERVAL)),
            ));
        }

        info!(
            alpha = config.alpha,
            window = config.window_size,
            "🚀 Engine started"
        );

        Ok(Self {
            config,
            cold,
            writer,
            model,
            cache,
            search,
            metrics,
            drift,
            pipeline,
            replay,
            tasks,
        })
    }

    async fn read_game(&self, gid: &str) -> Result<Vec<PredictionRecord>> {
        let cold = self.cold.clone();
        let gid = gid.to_string();
        tokio::task::spawn_blocking(move || cold.read_game(&gid))
            .await
            .context("History read task failed")?
    }

    /// Smoothed trajectory rebuilt from stored history. The smoother runs over
    /// the whole game so points at or after `since` match what was live.
    pub async fn history(&self, gid: &str, since: Option<i64>) -> Result<HistoryResponse> {
        let records = self.read_game(gid).await?;
        let points = self
            .model
            .timeline(&records)
            .into_iter()
            .filter(|s| since.map_or(true, |since| s.ts >= since))
            .map(|s| HistoryPoint {
                ts: s.ts,
                p_win: s.p_win,
            })
            .collect();
        Ok(HistoryResponse {
            gid: gid.to_string(),
            points,
        })
    }

    /// Buckets ranked by mean attribution over the points where they appear.
    pub async fn top_buckets(&self, gid: &str, k: usize) -> Result<TopBucketsResponse> {
        let records = self.read_game(gid).await?;
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for snapshot in self.model.timeline(&records) {
            for (bucket, value) in snapshot.explain {
                let entry = sums.entry(bucket).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }

        let mut items: Vec<TopBucket> = sums
            .into_iter()
            .map(|(bucket, (sum, n))| TopBucket {
                bucket,
                impact: sum / n as f64,
            })
            .collect();
        items.sort_by(|a, b| {
            b.impact
                .total_cmp(&a.impact)
                .then_with(|| a.bucket.cmp(&b.bucket))
        });
        items.truncate(k);
        Ok(TopBucketsResponse {
            gid: gid.to_string(),
            items,
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::PartitionKey;
    use crate::error::IngestOutcome;
    use crate::storage::MemoryLog;

    fn engine(dir: &std::path::Path) -> Engine {
        let config = EngineConfig {
            data_dir: dir.to_path_buf(),
            alpha: 0.3,
            ..EngineConfig::default()
        };
        let log = Arc::new(MemoryLog::new(Arc::new(|_ts: i64| PartitionKey::new(2024, 1))));
        Engine::with_cold(config, log).unwrap()
    }

    #[tokio::test]
    async fn test_history_since_keeps_smoothing_context() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(engine.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.52)), IngestOutcome::Accepted);
        assert_eq!(engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.60)), IngestOutcome::Accepted);

        let all = engine.history("G1", None).await.unwrap();
        assert_eq!(all.points.len(), 2);

        let tail = engine.history("G1", Some(2_000)).await.unwrap();
        assert_eq!(tail.points.len(), 1);
        assert!((tail.points[0].p_win - 0.544).abs() < 1e-12);

        assert!(engine.history("nope", None).await.unwrap().points.is_empty());
    }

    #[tokio::test]
    async fn test_top_buckets_ranked_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.pipeline.ingest(
            PredictionRecord::new("G1", 1_000, 0.5)
                .with_feature("QB_pressure_rate", 0.4)
                .with_feature("DEF_pressure", -0.2),
        );
        engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.55).with_feature("QB_pressure_rate", 0.2));

        let top = engine.top_buckets("G1", 1).await.unwrap();
        assert_eq!(top.items.len(), 1);
        assert_eq!(top.items[0].bucket, "QB");

        let all = engine.top_buckets("G1", 50).await.unwrap();
        assert!(all
            .items
            .windows(2)
            .all(|w| w[0].impact >= w[1].impact));
    }
}
