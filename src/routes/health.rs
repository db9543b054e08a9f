use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub events: usize,
    pub armed_reminders: usize,
    pub subscribers: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        events: state.store.count().await,
        armed_reminders: state.scheduler.armed_count().await,
        subscribers: state.reminders.subscriber_count(),
    };

    (StatusCode::OK, Json(response))
}
