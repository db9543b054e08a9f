use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{AppError, AppResult};
use crate::services::delivery::Reminder;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stream", get(stream_reminders))
        .route("/test", post(send_test_notification))
}

/// Server-sent event stream of fired reminders (`event: notification`).
async fn stream_reminders(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.reminders.subscribe();
    tracing::info!(
        "Reminder subscriber connected ({} total)",
        state.reminders.subscriber_count()
    );

    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(reminder) => match SseEvent::default().event("notification").json_data(&reminder) {
                    Ok(event) => return Some((Ok::<SseEvent, Infallible>(event), rx)),
                    Err(e) => {
                        tracing::warn!("Failed to encode reminder {}: {}", reminder.id, e);
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Reminder subscriber lagged; {} reminder(s) skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Send the reminder for the first stored event right away.
async fn send_test_notification(State(state): State<Arc<AppState>>) -> AppResult<Json<Reminder>> {
    state
        .scheduler
        .send_test()
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No events available".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::{NewEvent, NotificationStatus};
    use crate::services::clock::SystemClock;
    use axum::body::Body;
    use chrono::{Duration, Utc};
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::default(), Arc::new(SystemClock)))
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn create_event(state: &Arc<AppState>) -> crate::db::models::Event {
        state
            .store
            .create(NewEvent {
                title: "Launch review".to_string(),
                description: "Go/no-go".to_string(),
                start_date: Utc::now() + Duration::hours(2),
                end_date: None,
                location: None,
                attachments: vec![],
                notification_status: NotificationStatus::Pending,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_without_events_is_not_found() {
        let state = test_state();
        let response = router()
            .with_state(state)
            .oneshot(request("POST", "/test"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_marks_first_event_sent() {
        let state = test_state();
        let event = create_event(&state).await;
        let _rx = state.reminders.subscribe();

        let response = router()
            .with_state(state.clone())
            .oneshot(request("POST", "/test"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.store.find_by_id(event.id).await.unwrap().notification_status,
            NotificationStatus::Sent
        );
    }

    #[tokio::test]
    async fn stream_emits_fired_reminders() {
        let state = test_state();
        let event = create_event(&state).await;

        let response = router()
            .with_state(state.clone())
            .oneshot(request("GET", "/stream"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.reminders.subscriber_count(), 1);

        state.scheduler.send_now(event.id).await.unwrap();

        let mut body = response.into_body();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let chunk = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();

        assert!(chunk.contains("event: notification"));
        assert!(chunk.contains(&event.id.to_string()));
    }
}
