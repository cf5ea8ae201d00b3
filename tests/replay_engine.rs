//! Replay over the SQLite cold store, driven through the engine.

use std::time::Duration;

use tokio::sync::broadcast;
use winprob_engine::models::{MessageKind, MessageSource, PredictionRecord, StreamMessage};
use winprob_engine::replay::ReplayStatus;
use winprob_engine::{Engine, EngineConfig};

fn engine(dir: &std::path::Path, grace_ms: u64) -> Engine {
    Engine::open(EngineConfig {
        data_dir: dir.to_path_buf(),
        alpha: 0.3,
        replay_min_delay_ms: 1,
        replay_grace_ms: grace_ms,
        ..EngineConfig::default()
    })
    .unwrap()
}

async fn next(feed: &mut broadcast::Receiver<StreamMessage>) -> StreamMessage {
    tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("replay message")
        .expect("feed open")
}

#[tokio::test]
async fn replay_matches_live_smoothing() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), 50);
    engine.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.52).with_feature("WR_sep", 0.3));
    engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.60).with_feature("WR_sep", 0.1));
    let live = engine.cache.get("G1").unwrap();

    let mut feed = engine.replay.feed("G1");
    engine.replay.start("G1", 1_000.0).unwrap();

    let opening = next(&mut feed).await;
    assert_eq!(opening.kind, MessageKind::GameState);
    assert_eq!(opening.source, Some(MessageSource::Replay));

    let mut messages = Vec::new();
    for _ in 0..4 {
        messages.push(next(&mut feed).await);
    }
    let kinds: Vec<MessageKind> = messages.iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![MessageKind::Prediction, MessageKind::Shap, MessageKind::Prediction, MessageKind::Shap]
    );
    assert_eq!(messages[0].p_win, Some(0.52));
    let last = &messages[3];
    assert_eq!(last.ts, Some(live.ts));
    assert_eq!(last.p_win, Some(live.p_win));
    assert_eq!(last.explain.as_ref(), Some(&live.explain));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = engine.replay.state("G1").unwrap();
    assert_eq!(state.status, ReplayStatus::Completed);
    assert_eq!(state.cursor, 5);
}

#[tokio::test]
async fn live_ingest_reaches_running_replay_until_game_ends() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), 5_000);
    engine.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.5));

    let mut feed = engine.replay.feed("G1");
    engine.replay.start("G1", 1_000.0).unwrap();
    for _ in 0..3 {
        next(&mut feed).await;
    }

    engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.8));
    let prediction = next(&mut feed).await;
    assert_eq!(prediction.kind, MessageKind::Prediction);
    assert_eq!(prediction.ts, Some(2_000));
    assert_eq!(next(&mut feed).await.kind, MessageKind::Shap);

    let state = engine.replay.end_game("G1").unwrap();
    assert_eq!(state.status, ReplayStatus::Completed);
    assert_eq!(state.cursor, 5);

    engine.pipeline.ingest(PredictionRecord::new("G1", 3_000, 0.8));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(feed.try_recv().is_err());

    assert_eq!(engine.replay.reset("G1").status, ReplayStatus::Idle);
}

#[tokio::test]
async fn replay_of_unknown_history_still_opens_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), 30);

    let mut feed = engine.replay.feed("NEW");
    engine.replay.start("NEW", 1.0).unwrap();
    let opening = next(&mut feed).await;
    assert_eq!(opening.kind, MessageKind::GameState);
    assert_eq!(opening.ts, None);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(engine.replay.state("NEW").unwrap().status, ReplayStatus::Completed);
}

#[tokio::test]
async fn live_burst_during_history_playback_is_replayed_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(EngineConfig {
        data_dir: dir.path().to_path_buf(),
        alpha: 0.3,
        subscriber_buffer: 4,
        replay_min_delay_ms: 1,
        replay_grace_ms: 3_000,
        ..EngineConfig::default()
    })
    .unwrap();
    engine.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.5));
    engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.55));

    let mut feed = engine.replay.feed("G1");
    engine.replay.start("G1", 1.0).unwrap();
    for _ in 0..3 {
        next(&mut feed).await;
    }

    // Arrives while the replay still owes a one second gap, and overruns the
    // four-slot live buffer.
    for i in 3..=10 {
        assert!(engine
            .pipeline
            .ingest(PredictionRecord::new("G1", i * 1_000, 0.6))
            .is_accepted());
    }

    let mut predictions = Vec::new();
    for _ in 0..18 {
        let msg = next(&mut feed).await;
        if msg.kind == MessageKind::Prediction {
            predictions.push(msg.ts.unwrap());
        }
    }
    let expected: Vec<i64> = (2..=10).map(|i| i * 1_000).collect();
    assert_eq!(predictions, expected);
    assert_eq!(engine.replay.state("G1").unwrap().status, ReplayStatus::Running);

    engine.replay.end_game("G1").unwrap();
}
