//! Initialization helpers for the application:
//! - seeding the event store from a JSON file
//! - background worker spawn helpers (reminder fire loop, startup reconciliation)

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::db::models::NewEvent;
use crate::db::{EventStore, StoreError};

/// Read a JSON array of events from `path`.
pub async fn load_seed_events(path: &Path) -> Result<Vec<NewEvent>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read seed events from {}", path.display()))?;
    let events: Vec<NewEvent> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse seed events in {}", path.display()))?;
    Ok(events)
}

/// Insert `events` into the store, skipping invalid and duplicate entries.
/// Returns how many were stored.
pub async fn seed_store(store: &EventStore, events: Vec<NewEvent>) -> usize {
    let mut stored = 0usize;

    for event in events {
        if let Err(reason) = event.validate() {
            tracing::warn!("Skipping seed event '{}': {}", event.title, reason);
            continue;
        }

        let title = event.title.clone();
        match store.create(event).await {
            Ok(_) => stored += 1,
            Err(StoreError::Conflict) => {
                tracing::warn!("Skipping duplicate seed event '{}'", title);
            }
            Err(e) => tracing::warn!("Failed to seed event '{}': {}", title, e),
        }
    }

    tracing::info!("Seeded {} event(s) into the store", stored);
    stored
}

/// Spawn background workers:
/// - the reminder fire loop
/// - the startup reconciliation pass, after the configured grace delay
///
/// Returns the `JoinHandle<()>`s so callers can await task shutdown. Each worker
/// listens for a shutdown notification via a `tokio::sync::broadcast::Sender<()>`.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Reminder fire loop
    {
        let scheduler = state.scheduler.clone();
        handles.push(tokio::spawn(scheduler.run(shutdown.subscribe())));
    }

    // Startup reconciliation
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let delay = Duration::from_millis(state.config.scheduler.reconcile_delay_ms);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Reconciliation cancelled by shutdown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            tracing::info!("Reconciling reminder timers with the event store");
            state.scheduler.reconcile().await;
        }));
    }

    handles
}
