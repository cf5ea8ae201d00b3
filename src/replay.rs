//! Replay engine
//!
//! One state machine per game: `Idle -> Running <-> Paused -> Completed`, and
//! `reset` returns any state to `Idle`. A running replay emits `game_state`,
//! then a `prediction`/`shap` pair for every stored point (oldest first), then
//! follows live hot-cache updates until nothing arrives within the grace
//! period or the game is ended.
//!
//! The cursor counts emitted messages. Every emission re-checks the session
//! under its lock, so a pause lands strictly between two messages and resume
//! continues at the exact next one, after whatever delay was still owed.
//! Live updates are collected at every wait, including while history plays
//! or the replay is paused, so none are lost before their turn comes.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{broadcast, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::cache::{HotCache, Subscription};
use crate::error::ReplayError;
use crate::models::{MessageSource, PredictionRecord, Snapshot, StreamMessage};
use crate::smoother::MetaModel;
use crate::storage::ColdLog;

/// Upper bound on the wait between two replayed points, whatever the speed.
const MAX_POINT_DELAY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl ReplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayStatus::Idle => "idle",
            ReplayStatus::Running => "running",
            ReplayStatus::Paused => "paused",
            ReplayStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayState {
    pub gid: String,
    pub status: ReplayStatus,
    pub cursor: u64,
    pub speed_multiplier: f64,
}

struct SessionInner {
    status: ReplayStatus,
    cursor: u64,
    speed: f64,
    /// Bumped on every start and reset; a loop only acts while its epoch is current.
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

struct ReplaySession {
    gid: String,
    inner: Mutex<SessionInner>,
    wake: Notify,
    feed: broadcast::Sender<StreamMessage>,
}

impl ReplaySession {
    fn state(&self) -> ReplayState {
        let inner = self.inner.lock();
        ReplayState {
            gid: self.gid.clone(),
            status: inner.status,
            cursor: inner.cursor,
            speed_multiplier: inner.speed,
        }
    }

    /// Status as seen by the loop of `epoch`; `None` once it should stop.
    fn status(&self, epoch: u64) -> Option<ReplayStatus> {
        let inner = self.inner.lock();
        if inner.epoch != epoch {
            return None;
        }
        match inner.status {
            ReplayStatus::Running | ReplayStatus::Paused => Some(inner.status),
            ReplayStatus::Idle | ReplayStatus::Completed => None,
        }
    }

    /// Emit one message if the loop is still current and running.
    fn commit(&self, epoch: u64, message: &StreamMessage) -> bool {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch || inner.status != ReplayStatus::Running {
            return false;
        }
        let _ = self.feed.send(message.clone());
        inner.cursor += 1;
        true
    }

    fn complete(&self, epoch: u64, why: &str) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch && inner.status == ReplayStatus::Running {
            inner.status = ReplayStatus::Completed;
            inner.task = None;
            info!(gid = %self.gid, cursor = inner.cursor, "🏁 Replay completed ({})", why);
        }
    }

    /// The loop of `epoch` is gone; its session must not stay running or paused.
    fn abandon(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch
            && matches!(inner.status, ReplayStatus::Running | ReplayStatus::Paused)
        {
            inner.status = ReplayStatus::Completed;
            inner.task = None;
            warn!(gid = %self.gid, cursor = inner.cursor, "Replay loop stopped unexpectedly, marking completed");
        }
    }
}

/// Held by the spawned loop; settles the session however the loop exits.
struct LoopGuard {
    session: Arc<ReplaySession>,
    epoch: u64,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.session.abandon(self.epoch);
    }
}

/// Live updates collected while history plays or the replay is paused.
struct LiveTail {
    live: Subscription,
    pending: VecDeque<Arc<Snapshot>>,
    last_ts: Option<i64>,
}

impl LiveTail {
    fn push(&mut self, snapshot: Arc<Snapshot>) {
        if self.last_ts.is_some_and(|ts| snapshot.ts <= ts) {
            return;
        }
        self.last_ts = Some(snapshot.ts);
        self.pending.push_back(snapshot);
    }
}

enum LoopEvent {
    Control,
    Live(Option<Arc<Snapshot>>),
    Timer,
}

/// Time to wait after point `i` before emitting point `i + 1`.
fn inter_point_delay(timeline: &[Snapshot], i: usize, speed: f64, min_delay: Duration) -> Duration {
    match timeline.get(i + 1) {
        Some(next) => {
            let dt_secs = (next.ts - timeline[i].ts).max(0) as f64 / speed / 1000.0;
            Duration::try_from_secs_f64(dt_secs)
                .unwrap_or(MAX_POINT_DELAY)
                .min(MAX_POINT_DELAY)
                .max(min_delay)
        }
        None => Duration::ZERO,
    }
}

pub struct ReplayEngine {
    cold: Arc<dyn ColdLog>,
    model: Arc<MetaModel>,
    cache: Arc<HotCache>,
    sessions: RwLock<HashMap<String, Arc<ReplaySession>>>,
    min_delay: Duration,
    grace: Duration,
    feed_capacity: usize,
}

impl ReplayEngine {
    pub fn new(
        cold: Arc<dyn ColdLog>,
        model: Arc<MetaModel>,
        cache: Arc<HotCache>,
        min_delay: Duration,
        grace: Duration,
        feed_capacity: usize,
    ) -> Self {
        Self {
            cold,
            model,
            cache,
            sessions: RwLock::new(HashMap::new()),
            min_delay,
            grace,
            feed_capacity: feed_capacity.max(1),
        }
    }

    fn session(&self, gid: &str) -> Arc<ReplaySession> {
        if let Some(session) = self.sessions.read().get(gid) {
            return session.clone();
        }
        self.sessions
            .write()
            .entry(gid.to_string())
            .or_insert_with(|| {
                let (feed, _) = broadcast::channel(self.feed_capacity);
                Arc::new(ReplaySession {
                    gid: gid.to_string(),
                    inner: Mutex::new(SessionInner {
                        status: ReplayStatus::Idle,
                        cursor: 0,
                        speed: 1.0,
                        epoch: 0,
                        task: None,
                    }),
                    wake: Notify::new(),
                    feed,
                })
            })
            .clone()
    }

    fn existing(&self, gid: &str) -> Result<Arc<ReplaySession>, ReplayError> {
        self.sessions
            .read()
            .get(gid)
            .cloned()
            .ok_or_else(|| ReplayError::UnknownGame(gid.to_string()))
    }

    /// Receive this game's replay messages. Creates an idle session if needed.
    pub fn feed(&self, gid: &str) -> broadcast::Receiver<StreamMessage> {
        self.session(gid).feed.subscribe()
    }

    pub fn state(&self, gid: &str) -> Option<ReplayState> {
        self.sessions.read().get(gid).map(|s| s.state())
    }

    pub fn start(self: &Arc<Self>, gid: &str, speed_multiplier: f64) -> Result<ReplayState, ReplayError> {
        if !speed_multiplier.is_finite() || speed_multiplier <= 0.0 {
            return Err(ReplayError::InvalidSpeed);
        }
        let session = self.session(gid);
        {
            let mut inner = session.inner.lock();
            match inner.status {
                ReplayStatus::Idle => {}
                ReplayStatus::Running => return Err(ReplayError::AlreadyRunning),
                other => {
                    return Err(ReplayError::InvalidTransition {
                        from: other.as_str(),
                        action: "start",
                    })
                }
            }
            inner.status = ReplayStatus::Running;
            inner.cursor = 0;
            inner.speed = speed_multiplier;
            inner.epoch += 1;
            let epoch = inner.epoch;
            let engine = self.clone();
            let loop_session = session.clone();
            inner.task = Some(tokio::spawn(async move {
                let _guard = LoopGuard {
                    session: loop_session.clone(),
                    epoch,
                };
                engine.run(loop_session, epoch).await;
            }));
        }
        info!(gid = %gid, speed = speed_multiplier, "▶️ Replay started");
        Ok(session.state())
    }

    pub fn pause(&self, gid: &str) -> Result<ReplayState, ReplayError> {
        self.transition(gid, ReplayStatus::Running, ReplayStatus::Paused, "pause")
    }

    pub fn resume(&self, gid: &str) -> Result<ReplayState, ReplayError> {
        self.transition(gid, ReplayStatus::Paused, ReplayStatus::Running, "resume")
    }

    fn transition(
        &self,
        gid: &str,
        from: ReplayStatus,
        to: ReplayStatus,
        action: &'static str,
    ) -> Result<ReplayState, ReplayError> {
        let session = self.existing(gid)?;
        {
            let mut inner = session.inner.lock();
            if inner.status != from {
                return Err(ReplayError::InvalidTransition {
                    from: inner.status.as_str(),
                    action,
                });
            }
            inner.status = to;
        }
        session.wake.notify_waiters();
        debug!(gid = %gid, "Replay {}", action);
        Ok(session.state())
    }

    /// The source game has ended: a running or paused replay completes now.
    pub fn end_game(&self, gid: &str) -> Result<ReplayState, ReplayError> {
        let session = self.existing(gid)?;
        {
            let mut inner = session.inner.lock();
            match inner.status {
                ReplayStatus::Running | ReplayStatus::Paused => {
                    inner.status = ReplayStatus::Completed;
                    inner.task = None;
                }
                other => {
                    return Err(ReplayError::InvalidTransition {
                        from: other.as_str(),
                        action: "end",
                    })
                }
            }
        }
        session.wake.notify_waiters();
        info!(gid = %gid, "🏁 Replay completed (game ended)");
        Ok(session.state())
    }

    /// Back to `Idle` from any state, stopping the emission loop.
    pub fn reset(&self, gid: &str) -> ReplayState {
        let session = self.session(gid);
        let task = {
            let mut inner = session.inner.lock();
            inner.status = ReplayStatus::Idle;
            inner.cursor = 0;
            inner.epoch += 1;
            inner.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        session.wake.notify_waiters();
        debug!(gid = %gid, "Replay reset");
        session.state()
    }

    async fn load_history(&self, gid: &str) -> Vec<PredictionRecord> {
        let cold = self.cold.clone();
        let owned = gid.to_string();
        match tokio::task::spawn_blocking(move || cold.read_game(&owned)).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                warn!(gid = %gid, "Replay history unavailable, continuing with live tail: {:#}", e);
                Vec::new()
            }
            Err(e) => {
                warn!(gid = %gid, "Replay history task failed: {}", e);
                Vec::new()
            }
        }
    }

    /// The live subscription overflowed: subscribe again and fill the gap from
    /// the cold store.
    async fn resync(&self, gid: &str, tail: &mut LiveTail) {
        warn!(gid = %gid, queued = tail.pending.len(), "Replay fell behind live feed, resubscribing");
        tail.live = self.cache.subscribe(gid);
        let history = self.load_history(gid).await;
        for snapshot in self.model.timeline(&history) {
            tail.push(Arc::new(snapshot));
        }
    }

    async fn run(self: Arc<Self>, session: Arc<ReplaySession>, epoch: u64) {
        let gid = session.gid.clone();
        let speed = session.inner.lock().speed;

        // Subscribe before reading history so no live point falls in between.
        let live = self.cache.subscribe(&gid);
        let history = self.load_history(&gid).await;
        let timeline = self.model.timeline(&history);
        let mut tail = LiveTail {
            live,
            pending: VecDeque::new(),
            last_ts: timeline.last().map(|s| s.ts),
        };

        let mut queue: VecDeque<(StreamMessage, Duration)> =
            VecDeque::with_capacity(1 + timeline.len() * 2);
        queue.push_back((
            StreamMessage::game_state(&gid, timeline.first(), MessageSource::Replay),
            Duration::ZERO,
        ));
        for (i, snapshot) in timeline.iter().enumerate() {
            let [prediction, shap] = StreamMessage::pair(snapshot, MessageSource::Replay);
            queue.push_back((prediction, Duration::ZERO));
            queue.push_back((shap, inter_point_delay(&timeline, i, speed, self.min_delay)));
        }
        debug!(gid = %gid, points = timeline.len(), "Replay timeline built");

        // Delay still owed before the next emission. Kept across pause/resume.
        let mut owed = Duration::ZERO;
        loop {
            let notified = session.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(status) = session.status(epoch) else {
                return;
            };
            let running = status == ReplayStatus::Running;

            if running && owed.is_zero() {
                if queue.is_empty() {
                    if let Some(snapshot) = tail.pending.pop_front() {
                        for message in StreamMessage::pair(&snapshot, MessageSource::Replay) {
                            queue.push_back((message, Duration::ZERO));
                        }
                    }
                }
                if let Some((message, _)) = queue.front() {
                    if session.commit(epoch, message) {
                        if let Some((_, delay)) = queue.pop_front() {
                            owed = delay;
                        }
                    }
                    continue;
                }
            }

            // Running with nothing to send means waiting on the live feed.
            let waiting_live = running && owed.is_zero();
            let timer = if waiting_live { self.grace } else { owed };
            let started = Instant::now();
            let event = tokio::select! {
                _ = &mut notified => LoopEvent::Control,
                update = tail.live.recv() => LoopEvent::Live(update),
                _ = tokio::time::sleep(timer), if running => LoopEvent::Timer,
            };
            if running && !waiting_live {
                owed = owed.saturating_sub(started.elapsed());
            }

            match event {
                LoopEvent::Control => {}
                LoopEvent::Live(Some(snapshot)) => tail.push(snapshot),
                LoopEvent::Live(None) => self.resync(&gid, &mut tail).await,
                LoopEvent::Timer if waiting_live => {
                    session.complete(epoch, "no live data within grace period");
                    return;
                }
                LoopEvent::Timer => owed = Duration::ZERO,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::PartitionKey;
    use crate::models::MessageKind;
    use crate::storage::MemoryLog;

    fn engine_with_history(points: &[(i64, f64)], grace: Duration) -> (Arc<ReplayEngine>, Arc<HotCache>) {
        let log = Arc::new(MemoryLog::new(Arc::new(|_ts: i64| PartitionKey::new(2024, 1))));
        for (ts, p) in points {
            log.append(&PredictionRecord::new("G1", *ts, *p)).unwrap();
        }
        let cache = Arc::new(HotCache::new(None, 64));
        let engine = Arc::new(ReplayEngine::new(
            log,
            Arc::new(MetaModel::new(0.3, 4)),
            cache.clone(),
            Duration::from_millis(1),
            grace,
            256,
        ));
        (engine, cache)
    }

    async fn next(feed: &mut broadcast::Receiver<StreamMessage>) -> StreamMessage {
        tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("replay message")
            .expect("feed open")
    }

    #[test]
    fn test_inter_point_delay_scaled_and_clamped() {
        let snap = |ts| Snapshot {
            gid: "G1".into(),
            ts,
            p_win: 0.5,
            explain: Default::default(),
            window: Vec::new(),
        };
        let timeline = vec![snap(0), snap(1_000), snap(1_001)];
        let min = Duration::from_millis(5);
        assert_eq!(inter_point_delay(&timeline, 0, 2.0, min), Duration::from_millis(500));
        assert_eq!(inter_point_delay(&timeline, 1, 1.0, min), min);
        assert_eq!(inter_point_delay(&timeline, 2, 1.0, min), Duration::ZERO);
        assert_eq!(inter_point_delay(&timeline, 0, 1e-20, min), MAX_POINT_DELAY);
    }

    #[tokio::test]
    async fn test_tiny_speed_still_plays_and_accepts_controls() {
        let (engine, _cache) = engine_with_history(&[(1_000, 0.5), (2_000, 0.6)], Duration::from_secs(5));
        let mut feed = engine.feed("G1");
        engine.start("G1", 1e-20).unwrap();

        assert_eq!(next(&mut feed).await.kind, MessageKind::GameState);
        assert_eq!(next(&mut feed).await.kind, MessageKind::Prediction);
        assert_eq!(next(&mut feed).await.kind, MessageKind::Shap);

        let state = engine.state("G1").unwrap();
        assert_eq!(state.status, ReplayStatus::Running);
        assert_eq!(state.cursor, 3);
        assert_eq!(engine.pause("G1").unwrap().status, ReplayStatus::Paused);
        assert_eq!(engine.end_game("G1").unwrap().status, ReplayStatus::Completed);
    }

    #[tokio::test]
    async fn test_stopped_loop_never_left_running() {
        let (engine, _cache) = engine_with_history(&[(1_000, 0.5), (100_000, 0.6)], Duration::from_secs(5));
        let mut feed = engine.feed("G1");
        engine.start("G1", 1.0).unwrap();
        next(&mut feed).await;

        let task = engine.sessions.read()["G1"].inner.lock().task.take().unwrap();
        task.abort();
        let _ = task.await;

        let state = engine.state("G1").unwrap();
        assert_eq!(state.status, ReplayStatus::Completed);
        assert!(engine.resume("G1").is_err());
    }

    #[tokio::test]
    async fn test_resume_waits_out_remaining_delay() {
        // 1000ms gap at 10x speed: 100ms before the second point.
        let (engine, _cache) = engine_with_history(&[(1_000, 0.5), (2_000, 0.6)], Duration::from_secs(5));
        let mut feed = engine.feed("G1");
        engine.start("G1", 10.0).unwrap();
        for _ in 0..3 {
            next(&mut feed).await;
        }

        engine.pause("G1").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(feed.try_recv().is_err());

        let resumed = Instant::now();
        engine.resume("G1").unwrap();
        let msg = next(&mut feed).await;
        assert_eq!(msg.ts, Some(2_000));
        assert!(resumed.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_live_updates_kept_while_paused() {
        let (engine, cache) = engine_with_history(&[(1_000, 0.5)], Duration::from_secs(5));
        let mut feed = engine.feed("G1");
        engine.start("G1", 1.0).unwrap();
        for _ in 0..3 {
            next(&mut feed).await;
        }
        engine.pause("G1").unwrap();

        for ts in [2_000, 3_000, 4_000] {
            cache.put(Snapshot {
                gid: "G1".into(),
                ts,
                p_win: 0.6,
                explain: Default::default(),
                window: Vec::new(),
            });
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.try_recv().is_err());

        engine.resume("G1").unwrap();
        let mut live = Vec::new();
        for _ in 0..6 {
            let msg = next(&mut feed).await;
            if msg.kind == MessageKind::Prediction {
                live.push(msg.ts.unwrap());
            }
        }
        assert_eq!(live, vec![2_000, 3_000, 4_000]);
        assert_eq!(engine.state("G1").unwrap().status, ReplayStatus::Running);
    }

    #[tokio::test]
    async fn test_full_replay_then_completed() {
        let (engine, _cache) =
            engine_with_history(&[(1_000, 0.52), (2_000, 0.60), (3_000, 0.4)], Duration::from_millis(50));
        let mut feed = engine.feed("G1");
        engine.start("G1", 1_000.0).unwrap();

        let first = next(&mut feed).await;
        assert_eq!(first.kind, MessageKind::GameState);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let msg = next(&mut feed).await;
            seen.push((msg.kind, msg.ts.unwrap()));
        }
        assert_eq!(
            seen,
            vec![
                (MessageKind::Prediction, 1_000),
                (MessageKind::Shap, 1_000),
                (MessageKind::Prediction, 2_000),
                (MessageKind::Shap, 2_000),
                (MessageKind::Prediction, 3_000),
                (MessageKind::Shap, 3_000),
            ]
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = engine.state("G1").unwrap();
        assert_eq!(state.status, ReplayStatus::Completed);
        assert_eq!(state.cursor, 7);
    }

    #[tokio::test]
    async fn test_state_machine_transitions() {
        let (engine, _cache) = engine_with_history(&[(1_000, 0.5)], Duration::from_secs(5));

        assert_eq!(engine.pause("G1").unwrap_err(), ReplayError::UnknownGame("G1".into()));
        assert_eq!(engine.start("G1", 0.0).unwrap_err(), ReplayError::InvalidSpeed);

        engine.start("G1", 1.0).unwrap();
        assert_eq!(engine.start("G1", 1.0).unwrap_err(), ReplayError::AlreadyRunning);
        assert!(matches!(
            engine.resume("G1").unwrap_err(),
            ReplayError::InvalidTransition { from: "running", .. }
        ));

        engine.pause("G1").unwrap();
        assert!(matches!(
            engine.start("G1", 1.0).unwrap_err(),
            ReplayError::InvalidTransition { from: "paused", action: "start" }
        ));
        engine.resume("G1").unwrap();

        engine.end_game("G1").unwrap();
        assert_eq!(engine.state("G1").unwrap().status, ReplayStatus::Completed);

        let state = engine.reset("G1");
        assert_eq!(state.status, ReplayStatus::Idle);
        assert_eq!(state.cursor, 0);
        engine.start("G1", 2.0).unwrap();
    }

    #[tokio::test]
    async fn test_pause_resume_without_gaps_or_repeats() {
        let points: Vec<(i64, f64)> = (1..=6).map(|i| (i * 1_000, 0.5)).collect();
        // 1000ms gaps at 25x speed: 40ms between points.
        let (engine, _cache) = engine_with_history(&points, Duration::from_millis(50));
        let mut feed = engine.feed("G1");
        engine.start("G1", 25.0).unwrap();

        let mut received = vec![next(&mut feed).await];
        received.push(next(&mut feed).await);
        received.push(next(&mut feed).await);
        engine.pause("G1").unwrap();
        let cursor_at_pause = engine.state("G1").unwrap().cursor;

        tokio::time::sleep(Duration::from_millis(150)).await;
        while let Ok(msg) = feed.try_recv() {
            received.push(msg);
        }
        assert_eq!(engine.state("G1").unwrap().cursor, cursor_at_pause);
        assert_eq!(received.len() as u64, cursor_at_pause);

        engine.resume("G1").unwrap();
        while received.len() < 13 {
            received.push(next(&mut feed).await);
        }

        let ts: Vec<Option<i64>> = received[1..].iter().map(|m| m.ts).collect();
        let expected: Vec<Option<i64>> = (1..=6).flat_map(|i| [Some(i * 1_000), Some(i * 1_000)]).collect();
        assert_eq!(ts, expected);
        for pair in received[1..].chunks(2) {
            assert_eq!(pair[0].kind, MessageKind::Prediction);
            assert_eq!(pair[1].kind, MessageKind::Shap);
        }
    }

    #[tokio::test]
    async fn test_live_tail_follows_history() {
        let (engine, cache) = engine_with_history(&[(1_000, 0.5)], Duration::from_secs(2));
        let mut feed = engine.feed("G1");
        engine.start("G1", 1_000.0).unwrap();
        for _ in 0..3 {
            next(&mut feed).await;
        }

        cache.put(Snapshot {
            gid: "G1".into(),
            ts: 5_000,
            p_win: 0.7,
            explain: Default::default(),
            window: Vec::new(),
        });
        let live = next(&mut feed).await;
        assert_eq!(live.kind, MessageKind::Prediction);
        assert_eq!(live.ts, Some(5_000));
        assert_eq!(live.source, Some(MessageSource::Replay));
        assert_eq!(next(&mut feed).await.kind, MessageKind::Shap);
    }
}
