//! HTTP surface
//!
//! REST routes for ingestion, replay control and read queries, plus the `/ws`
//! stream. Handlers live in `routes`.

pub mod routes;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::engine::Engine;
use crate::gateway::websocket_handler;
use crate::middleware::request_logging;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = AppState { engine };

    let game_routes = Router::new()
        .route("/games/:gid/ingest", post(routes::ingest))
        .route("/games/:gid/start", post(routes::start_replay))
        .route("/games/:gid/pause", post(routes::pause_replay))
        .route("/games/:gid/resume", post(routes::resume_replay))
        .route("/games/:gid/end", post(routes::end_game))
        .route("/games/:gid/reset", post(routes::reset_replay))
        .route("/games/:gid/replay", get(routes::replay_status))
        .route("/games/:gid/metrics", get(routes::game_metrics))
        .route("/games/:gid/snapshot", get(routes::snapshot))
        .route("/games/:gid/history", get(routes::history))
        .route("/games/:gid/topk", get(routes::top_buckets));

    Router::new()
        .route("/health", get(routes::health_check))
        .route("/ws", get(websocket_handler))
        .route("/metrics", get(routes::global_metrics))
        .route("/search", get(routes::search))
        .merge(game_routes)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
