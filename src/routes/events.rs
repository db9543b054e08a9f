use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::db::models::{Event, EventPatch, NewEvent};
use crate::error::{AppError, AppResult};
use crate::services::delivery::Reminder;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_events).post(create_event))
        .route("/search", get(search_events))
        .route("/range", get(events_in_range))
        .route(
            "/:id",
            get(get_event).put(update_event).delete(delete_event),
        )
        .route("/:id/snooze", post(snooze_event))
        .route("/:id/dismiss", post(dismiss_event))
        .route("/:id/notify", post(notify_event))
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_events(State(state): State<Arc<AppState>>) -> Json<Vec<Event>> {
    Json(state.store.find_all().await)
}

async fn search_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<Event>> {
    let q = query.q.unwrap_or_default();
    Json(state.store.search(q.trim()).await)
}

/// Events starting inside `[start, end]`.
async fn events_in_range(
    State(state): State<Arc<AppState>>,
    Query(range): Query<RangeQuery>,
) -> AppResult<Json<Vec<Event>>> {
    if range.start > range.end {
        return Err(AppError::BadRequest(
            "start must not be later than end".to_string(),
        ));
    }
    Ok(Json(
        state.store.find_by_date_range(range.start, range.end).await,
    ))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Event>> {
    state
        .store
        .find_by_id(id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Event not found".to_string()))
}

async fn create_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewEvent>,
) -> AppResult<(StatusCode, Json<Event>)> {
    payload.validate().map_err(AppError::Validation)?;

    let event = state.store.create(payload).await?;
    tracing::info!("Created event {} ({})", event.id, event.title);
    Ok((StatusCode::CREATED, Json(event)))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<EventPatch>,
) -> AppResult<Json<Event>> {
    patch.validate().map_err(AppError::Validation)?;

    let event = state.store.update(id, patch).await?;
    Ok(Json(event))
}

async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    state.scheduler.cancel_notification(id).await;

    if !state.store.delete(id).await {
        return Err(AppError::NotFound("Event not found".to_string()));
    }
    Ok(Json(json!({ "success": true })))
}

async fn snooze_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Event>> {
    Ok(Json(state.scheduler.snooze_notification(id).await?))
}

async fn dismiss_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Event>> {
    Ok(Json(state.scheduler.dismiss_notification(id).await?))
}

/// Deliver the reminder for this event immediately.
async fn notify_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Reminder>> {
    Ok(Json(state.scheduler.send_now(id).await?))
}
