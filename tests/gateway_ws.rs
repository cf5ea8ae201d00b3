//! Websocket gateway against a bound server with a real client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use winprob_engine::models::PredictionRecord;
use winprob_engine::{api, Engine, EngineConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve(dir: &std::path::Path) -> (Arc<Engine>, String) {
    let engine = Arc::new(
        Engine::open(EngineConfig {
            data_dir: dir.to_path_buf(),
            alpha: 0.3,
            replay_min_delay_ms: 1,
            replay_grace_ms: 100,
            ..EngineConfig::default()
        })
        .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::create_router(engine.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (engine, format!("ws://{}/ws", addr))
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn subscribe_receives_game_state_then_live_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, url) = serve(dir.path()).await;
    engine.pipeline.ingest(PredictionRecord::new("G1", 1_000, 0.52));

    let (mut client, _) = connect_async(&url).await.unwrap();
    send(&mut client, json!({"action": "subscribe", "gid": "G1"})).await;

    let opening = recv(&mut client).await;
    assert_eq!(opening["type"], "game_state");
    assert_eq!(opening["gid"], "G1");
    assert_eq!(opening["ts"], 1000);

    engine.pipeline.ingest(PredictionRecord::new("G1", 2_000, 0.60).with_feature("score_diff", 0.2));
    let prediction = recv(&mut client).await;
    assert_eq!(prediction["type"], "prediction");
    assert_eq!(prediction["source"], "live");
    assert!((prediction["p_win"].as_f64().unwrap() - 0.544).abs() < 1e-12);
    let shap = recv(&mut client).await;
    assert_eq!(shap["type"], "shap");
    assert_eq!(shap["explain"]["SITUATION"], 0.2);

    send(&mut client, json!({"action": "unsubscribe", "gid": "G1"})).await;
    send(&mut client, json!({"type": "ping", "ts": 42})).await;
    let pong = recv(&mut client).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 42);

    engine.pipeline.ingest(PredictionRecord::new("G1", 3_000, 0.6));
    assert!(tokio::time::timeout(Duration::from_millis(100), client.next()).await.is_err());
}

#[tokio::test]
async fn malformed_frames_get_errors_and_connection_survives() {
    let dir = tempfile::tempdir().unwrap();
    let (_engine, url) = serve(dir.path()).await;
    let (mut client, _) = connect_async(&url).await.unwrap();

    client.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(recv(&mut client).await["type"], "error");

    send(&mut client, json!({"action": "subscribe"})).await;
    let error = recv(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "missing gid");

    send(&mut client, json!({"type": "ping"})).await;
    assert_eq!(recv(&mut client).await["type"], "pong");
}

#[tokio::test]
async fn replay_reaches_subscribers_tagged_as_replay() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, url) = serve(dir.path()).await;
    engine.pipeline.ingest(PredictionRecord::new("G7", 1_000, 0.4));
    engine.pipeline.ingest(PredictionRecord::new("G7", 2_000, 0.5));

    let (mut client, _) = connect_async(&url).await.unwrap();
    send(&mut client, json!({"action": "subscribe", "gid": "G7"})).await;
    assert_eq!(recv(&mut client).await["source"], "live");

    engine.replay.start("G7", 1_000.0).unwrap();
    let mut frames = Vec::new();
    for _ in 0..5 {
        frames.push(recv(&mut client).await);
    }
    assert!(frames.iter().all(|f| f["source"] == "replay"));
    assert_eq!(frames[0]["type"], "game_state");
    let ts: Vec<i64> = frames[1..].iter().map(|f| f["ts"].as_i64().unwrap()).collect();
    assert_eq!(ts, vec![1_000, 1_000, 2_000, 2_000]);
}
