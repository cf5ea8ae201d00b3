use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::AppState;
use crate::cache::CacheStats;
use crate::error::{IngestOutcome, RejectReason, ReplayError};
use crate::metrics::{GameMetrics, MetricsSnapshot};
use crate::models::{
    Features, HistoryResponse, PredictionRecord, SearchEntry, Snapshot, TopBucketsResponse,
};
use crate::replay::{ReplayState, ReplayStatus};
use crate::storage::WriterStats;

const DEFAULT_TOP_K: usize = 15;
const MAX_TOP_K: usize = 50;

// ===== Route Handlers =====

pub async fn health_check() -> &'static str {
    "🏈 winprob engine operational"
}

/// Ingest one prediction. The path gid wins; a body gid must agree with it.
pub async fn ingest(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    payload: Result<Json<IngestBody>, JsonRejection>,
) -> Response {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => {
            tracing::debug!(gid = %gid, "Unparseable ingest body: {}", rejection.body_text());
            return malformed(&state);
        }
    };
    if body.gid.as_deref().is_some_and(|body_gid| body_gid != gid) {
        return malformed(&state);
    }

    let record = PredictionRecord {
        gid,
        ts: body.ts,
        raw_p_win: body.raw_p_win,
        features: body.features,
        play_id: body.play_id,
        description: body.description,
    };
    let pipeline = state.engine.pipeline.clone();
    let outcome = match tokio::task::spawn_blocking(move || pipeline.ingest(record)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return ApiError::Internal(anyhow::anyhow!("ingest task failed: {}", e)).into_response()
        }
    };

    match outcome {
        IngestOutcome::Accepted => (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response(),
        IngestOutcome::Duplicate => (StatusCode::OK, Json(json!({ "status": "duplicate" }))).into_response(),
        IngestOutcome::Rejected(reason) => rejected(reason),
    }
}

/// Bodies that never reach the pipeline still count as malformed ingests.
fn malformed(state: &AppState) -> Response {
    let outcome = IngestOutcome::Rejected(RejectReason::Malformed);
    state.engine.metrics.record_outcome(&outcome);
    rejected(RejectReason::Malformed)
}

fn rejected(reason: RejectReason) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "rejected", "reason": reason })),
    )
        .into_response()
}

/// Start a replay. An empty body means real-time speed.
pub async fn start_replay(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    body: Bytes,
) -> Result<Json<ReplayState>, ApiError> {
    let speed = if body.iter().all(u8::is_ascii_whitespace) {
        1.0
    } else {
        let request: StartRequest = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid start body: {}", e)))?;
        request.speed_multiplier.unwrap_or(1.0)
    };
    Ok(Json(state.engine.replay.start(&gid, speed)?))
}

pub async fn pause_replay(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<ReplayState>, ApiError> {
    Ok(Json(state.engine.replay.pause(&gid)?))
}

pub async fn resume_replay(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<ReplayState>, ApiError> {
    Ok(Json(state.engine.replay.resume(&gid)?))
}

pub async fn end_game(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<ReplayState>, ApiError> {
    Ok(Json(state.engine.replay.end_game(&gid)?))
}

pub async fn reset_replay(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Json<ReplayState> {
    Json(state.engine.replay.reset(&gid))
}

/// Replay state; games never started report `idle`.
pub async fn replay_status(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Json<ReplayState> {
    Json(state.engine.replay.state(&gid).unwrap_or(ReplayState {
        gid,
        status: ReplayStatus::Idle,
        cursor: 0,
        speed_multiplier: 1.0,
    }))
}

pub async fn game_metrics(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Json<GameMetrics> {
    Json(state.engine.metrics.game(&gid))
}

pub async fn snapshot(
    State(state): State<AppState>,
    Path(gid): Path<String>,
) -> Result<Json<Snapshot>, ApiError> {
    state
        .engine
        .cache
        .get(&gid)
        .map(|s| Json(s.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("Game {} not found", gid)))
}

pub async fn history(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    Ok(Json(state.engine.history(&gid, params.since).await?))
}

pub async fn top_buckets(
    State(state): State<AppState>,
    Path(gid): Path<String>,
    Query(params): Query<TopKQuery>,
) -> Result<Json<TopBucketsResponse>, ApiError> {
    let k = params.k.unwrap_or(DEFAULT_TOP_K);
    if !(1..=MAX_TOP_K).contains(&k) {
        return Err(ApiError::BadRequest(format!("k must be between 1 and {}", MAX_TOP_K)));
    }
    Ok(Json(state.engine.top_buckets(&gid, k).await?))
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Json<SearchResponse> {
    let query = params.q.unwrap_or_default();
    let results = state.engine.search.search(&query);
    Json(SearchResponse {
        query,
        count: results.len(),
        results,
    })
}

pub async fn global_metrics(State(state): State<AppState>) -> Json<GlobalMetrics> {
    let engine = &state.engine;
    let writer = engine.writer.stats();
    Json(GlobalMetrics {
        degraded: writer.degraded,
        pipeline: engine.metrics.snapshot(),
        writer,
        cache: engine.cache.stats(),
        drift_dropped: engine.drift.dropped(),
    })
}

// ===== Request/Response Types =====

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    gid: Option<String>,
    ts: i64,
    raw_p_win: f64,
    #[serde(default)]
    features: Features,
    play_id: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct StartRequest {
    speed_multiplier: Option<f64>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    /// Lower bound on `ts`, inclusive.
    since: Option<i64>,
}

#[derive(Deserialize)]
pub struct TopKQuery {
    k: Option<usize>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    q: Option<String>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    query: String,
    count: usize,
    results: Vec<SearchEntry>,
}

#[derive(Serialize)]
pub struct GlobalMetrics {
    degraded: bool,
    pipeline: MetricsSnapshot,
    writer: WriterStats,
    cache: CacheStats,
    drift_dropped: u64,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Internal(anyhow::Error),
    Replay(ReplayError),
    NotFound(String),
    BadRequest(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        ApiError::Replay(err)
    }
}

fn error_response(status: StatusCode, reason: &str, message: String) -> Response {
    let body = json!({
        "status": "error",
        "reason": reason,
        "message": message,
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:#}", err);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error".to_string(),
                )
            }
            ApiError::Replay(err) => {
                let status = match err {
                    ReplayError::AlreadyRunning | ReplayError::InvalidTransition { .. } => {
                        StatusCode::CONFLICT
                    }
                    ReplayError::InvalidSpeed => StatusCode::BAD_REQUEST,
                    ReplayError::UnknownGame(_) => StatusCode::NOT_FOUND,
                };
                error_response(status, err.code(), err.to_string())
            }
            ApiError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => error_response(StatusCode::BAD_REQUEST, "bad_request", msg),
        }
    }
}
