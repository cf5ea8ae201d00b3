//! Meta-model: exponential smoothing over the upstream win probability
//!
//! `new_p = alpha * raw + (1 - alpha) * ema`, seeded with the first raw value
//! for a game. Each step also records its bucket attribution in a bounded
//! FIFO window that travels with every snapshot.
//!
//! Smoother state is private to this module; callers only see snapshots.

pub mod explainer;

pub use explainer::{BucketExplainer, Explainer, OTHER_BUCKET};

use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use crate::models::{Explain, Features, ImportanceEntry, PredictionRecord, Snapshot};

/// Running state for one game.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmootherState {
    ema_value: Option<f64>,
    last_ts: Option<i64>,
    window: VecDeque<ImportanceEntry>,
}

impl SmootherState {
    pub fn last_ts(&self) -> Option<i64> {
        self.last_ts
    }

    fn window_vec(&self) -> Vec<ImportanceEntry> {
        self.window.iter().cloned().collect()
    }
}

pub struct MetaModel {
    alpha: f64,
    window_size: usize,
    explainer: Arc<dyn Explainer>,
    states: RwLock<HashMap<String, Arc<Mutex<SmootherState>>>>,
}

impl MetaModel {
    pub fn new(alpha: f64, window_size: usize) -> Self {
        Self::with_explainer(alpha, window_size, Arc::new(BucketExplainer::default()))
    }

    pub fn with_explainer(alpha: f64, window_size: usize, explainer: Arc<dyn Explainer>) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            window_size: window_size.max(1),
            explainer,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// One smoothing step. Pure: depends only on its arguments.
    pub fn smooth(
        &self,
        ts: i64,
        raw_p_win: f64,
        features: &Features,
        prior: &SmootherState,
    ) -> (f64, Explain, SmootherState) {
        let p_win = match prior.ema_value {
            Some(ema) => self.alpha * raw_p_win + (1.0 - self.alpha) * ema,
            None => raw_p_win,
        };
        let explain = self.explainer.explain(features);

        let mut window = prior.window.clone();
        window.push_back(ImportanceEntry {
            ts,
            buckets: explain.clone(),
        });
        while window.len() > self.window_size {
            window.pop_front();
        }

        let state = SmootherState {
            ema_value: Some(p_win),
            last_ts: Some(ts),
            window,
        };
        (p_win, explain, state)
    }

    fn slot(&self, gid: &str) -> Arc<Mutex<SmootherState>> {
        if let Some(slot) = self.states.read().get(gid) {
            return slot.clone();
        }
        self.states
            .write()
            .entry(gid.to_string())
            .or_default()
            .clone()
    }

    fn step(&self, state: &mut SmootherState, record: &PredictionRecord) -> Snapshot {
        let (p_win, explain, next) =
            self.smooth(record.ts, record.raw_p_win, &record.features, state);
        *state = next;
        Snapshot {
            gid: record.gid.clone(),
            ts: record.ts,
            p_win,
            explain,
            window: state.window_vec(),
        }
    }

    /// Advance the game's live state with an accepted record.
    pub fn update(&self, record: &PredictionRecord) -> Snapshot {
        let slot = self.slot(&record.gid);
        let mut state = slot.lock();
        self.step(&mut state, record)
    }

    /// Rebuild a game's live state from its stored history. Returns the last
    /// snapshot produced, if any.
    pub fn warm(&self, gid: &str, history: &[PredictionRecord]) -> Option<Snapshot> {
        let slot = self.slot(gid);
        let mut state = slot.lock();
        *state = SmootherState::default();
        history
            .iter()
            .map(|record| self.step(&mut state, record))
            .last()
    }

    /// Deterministic snapshots for `history` from a fresh state. Leaves the
    /// live state untouched.
    pub fn timeline(&self, history: &[PredictionRecord]) -> Vec<Snapshot> {
        let mut state = SmootherState::default();
        history
            .iter()
            .map(|record| self.step(&mut state, record))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_seeds_then_smooths() {
        let model = MetaModel::new(0.3, 8);
        let first = model.update(&PredictionRecord::new("G1", 1_000, 0.52));
        let second = model.update(&PredictionRecord::new("G1", 2_000, 0.60));

        assert!((first.p_win - 0.52).abs() < 1e-12);
        assert!((second.p_win - 0.544).abs() < 1e-12);
        assert_eq!(second.window.len(), 2);
    }

    #[test]
    fn test_smooth_is_pure() {
        let model = MetaModel::new(0.15, 4);
        let features = Features::from([("WR_sep".to_string(), 0.3)]);
        let prior = model.smooth(1, 0.4, &features, &SmootherState::default()).2;

        let a = model.smooth(2, 0.7, &features, &prior);
        let b = model.smooth(2, 0.7, &features, &prior);
        assert_eq!(a, b);
        assert_eq!(a.2.last_ts(), Some(2));
    }

    #[test]
    fn test_window_is_fifo_bounded() {
        let model = MetaModel::new(0.5, 3);
        let mut last = None;
        for ts in 1..=5 {
            last = Some(model.update(&PredictionRecord::new("G1", ts, 0.5)));
        }
        let window: Vec<i64> = last.unwrap().window.iter().map(|e| e.ts).collect();
        assert_eq!(window, vec![3, 4, 5]);
    }

    #[test]
    fn test_games_are_independent() {
        let model = MetaModel::new(0.5, 3);
        model.update(&PredictionRecord::new("G1", 1, 0.9));
        let other = model.update(&PredictionRecord::new("G2", 1, 0.1));
        assert!((other.p_win - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_timeline_matches_live_updates() {
        let model = MetaModel::new(0.3, 4);
        let history: Vec<PredictionRecord> = [0.5, 0.7, 0.4]
            .iter()
            .enumerate()
            .map(|(i, p)| PredictionRecord::new("G1", (i as i64 + 1) * 1000, *p))
            .collect();

        let live: Vec<Snapshot> = history.iter().map(|r| model.update(r)).collect();
        assert_eq!(model.timeline(&history), live);

        let fresh = MetaModel::new(0.3, 4);
        assert_eq!(fresh.warm("G1", &history), live.last().cloned());
        let next = PredictionRecord::new("G1", 4000, 0.6);
        assert_eq!(fresh.update(&next), model.update(&next));
    }
}
