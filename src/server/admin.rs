//! Admin HTTP surface over the session cache.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::session::SessionService;

/// State shared by the admin handlers
#[derive(Debug, Clone)]
pub struct AdminState {
    /// Session cache being administered
    pub sessions: Arc<SessionService>,
    /// When the daemon started
    pub start_time: Instant,
}

impl AdminState {
    /// State over `sessions`, started now
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self {
            sessions,
            start_time: Instant::now(),
        }
    }
}

/// Create the admin router
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/sessions/sweep", post(sweep_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/peers/:addr/sessions", delete(delete_peer_sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Seconds since start
    pub uptime_secs: u64,
    /// Sessions cached
    pub sessions: usize,
}

async fn health_check(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        sessions: state.sessions.len().await,
    })
}

async fn list_sessions(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.sessions.summaries().await)
}

async fn get_session(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.summary(&id).await {
        Some(summary) => (StatusCode::OK, Json(serde_json::json!(summary))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Session not found"})),
        ),
    }
}

async fn delete_session(
    State(state): State<Arc<AdminState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if state.sessions.invalidate_key(&id).await {
        tracing::info!(session_id = %id, "session invalidated by admin");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_peer_sessions(
    State(state): State<Arc<AdminState>>,
    Path(addr): Path<String>,
) -> impl IntoResponse {
    let removed = state.sessions.invalidate_host(&addr).await;
    tracing::info!(peer = %addr, removed, "peer sessions invalidated by admin");
    Json(serde_json::json!({ "removed": removed }))
}

async fn sweep_sessions(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let swept = state.sessions.sweep_expired().await;
    Json(serde_json::json!({ "swept": swept }))
}
