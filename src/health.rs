//! Health, status and metrics endpoints
use crate::connectors::{AccountInfo, ConnectionState, PlatformIdentifier};
use crate::manager::{ManagerCounters, ManagerState};
use crate::routes::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness view of the terminal link
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSnapshot {
    pub platform: PlatformIdentifier,
    pub state: ConnectionState,
    pub connected: bool,
    /// Present only while the manager is Ready and the terminal answered
    pub account_info: Option<AccountInfo>,
    pub timestamp: DateTime<Utc>,
}

/// Readiness/monitoring view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub health: HealthSnapshot,
    pub manager_state: ManagerState,
    /// Terminal binding behind the connector; `paper` means simulated fills
    pub binding: String,
    pub counters: ManagerCounters,
    pub uptime_secs: u64,
    pub version: String,
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_check))
        .route("/metrics", get(metrics))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.manager.health().await)
}

async fn status_check(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.manager.status().await)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.manager.metrics().render(),
    )
}
