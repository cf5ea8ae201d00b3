//! Drift / retrain agent
//!
//! Watches `|raw - smoothed|` per game over a rolling window. When the mean of
//! a full window stays above the threshold it raises `DriftDetected` once, and
//! re-arms after the mean falls back below it. Purely advisory: the pipeline
//! hands observations over with `try_send` and never waits on this task.

use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::AsyncWriteExt,
    sync::{broadcast, mpsc},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DriftObservation {
    pub gid: String,
    pub ts: i64,
    pub raw_p_win: f64,
    pub p_win: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftDetected {
    pub gid: String,
    pub ts: i64,
    pub mean_divergence: f64,
    pub threshold: f64,
    pub window: usize,
}

#[derive(Default)]
struct GameDrift {
    divergences: VecDeque<f64>,
    sum: f64,
    flagged: bool,
}

/// Rolling divergence tracker. Single-threaded; owned by the agent task.
pub struct DriftMonitor {
    window: usize,
    threshold: f64,
    games: HashMap<String, GameDrift>,
}

impl DriftMonitor {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            games: HashMap::new(),
        }
    }

    pub fn observe(&mut self, obs: &DriftObservation) -> Option<DriftDetected> {
        let game = self.games.entry(obs.gid.clone()).or_default();
        let divergence = (obs.raw_p_win - obs.p_win).abs();
        game.divergences.push_back(divergence);
        game.sum += divergence;
        if game.divergences.len() > self.window {
            if let Some(old) = game.divergences.pop_front() {
                game.sum -= old;
            }
        }
        if game.divergences.len() < self.window {
            return None;
        }

        let mean = game.sum / self.window as f64;
        if mean > self.threshold {
            if game.flagged {
                return None;
            }
            game.flagged = true;
            return Some(DriftDetected {
                gid: obs.gid.clone(),
                ts: obs.ts,
                mean_divergence: mean,
                threshold: self.threshold,
                window: self.window,
            });
        }
        game.flagged = false;
        None
    }
}

/// Handle used by the pipeline. Cloning is cheap.
#[derive(Clone)]
pub struct DriftAgent {
    tx: mpsc::Sender<DriftObservation>,
    events: broadcast::Sender<DriftDetected>,
    dropped: Arc<AtomicU64>,
}

impl DriftAgent {
    /// Build the handle and the receiving half for `run`.
    pub fn new(queue_capacity: usize) -> (Self, mpsc::Receiver<DriftObservation>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (events, _) = broadcast::channel(256);
        let agent = Self {
            tx,
            events,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (agent, rx)
    }

    /// Never blocks. Observations are shed when the agent falls behind.
    pub fn observe(&self, obs: DriftObservation) {
        if self.tx.try_send(obs).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriftDetected> {
        self.events.subscribe()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn run(self, mut rx: mpsc::Receiver<DriftObservation>, mut monitor: DriftMonitor) {
        info!(
            "📈 Drift agent started (window={}, threshold={})",
            monitor.window, monitor.threshold
        );
        while let Some(obs) = rx.recv().await {
            if let Some(event) = monitor.observe(&obs) {
                warn!(
                    gid = %event.gid,
                    ts = event.ts,
                    mean_divergence = event.mean_divergence,
                    "Drift detected"
                );
                let _ = self.events.send(event);
            }
        }
        debug!("Drift agent input closed");
    }
}

#[derive(Debug, Serialize)]
struct RetrainRequest<'a> {
    gid: &'a str,
    ts: i64,
    reason: String,
    mean_divergence: f64,
    requested_at: String,
}

/// Appends one JSON line per drift event to the retrain request log.
pub struct RetrainLogger {
    path: PathBuf,
}

impl RetrainLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, event: &DriftDetected) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let request = RetrainRequest {
            gid: &event.gid,
            ts: event.ts,
            reason: format!(
                "mean divergence {:.4} over {} updates exceeds {:.4}",
                event.mean_divergence, event.window, event.threshold
            ),
            mean_divergence: event.mean_divergence,
            requested_at: chrono::Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_string(&request).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    pub async fn run(self, mut events: broadcast::Receiver<DriftDetected>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.append(&event).await {
                        error!(gid = %event.gid, "Failed to write retrain request: {}", e);
                    } else {
                        info!(gid = %event.gid, "🔄 Retrain requested");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Retrain logger lagged, skipped {} drift events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
