use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use http::HeaderValue;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use db::EventStore;
use services::clock::{Clock, SystemClock};
use services::delivery::BroadcastSink;
use services::init;
use services::scheduler::NotificationScheduler;

pub struct AppState {
    pub config: Config,
    pub store: Arc<EventStore>,
    pub scheduler: Arc<NotificationScheduler>,
    pub reminders: BroadcastSink,
}

impl AppState {
    /// Wire the store, the broadcast sink and the scheduler together.
    pub fn new(config: Config, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(EventStore::new(clock.clone()));
        let reminders = BroadcastSink::new(config.scheduler.reminder_channel_capacity);
        let scheduler =
            NotificationScheduler::new(store.clone(), Arc::new(reminders.clone()), clock);

        Self {
            config,
            store,
            scheduler,
            reminders,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_reminders=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Event Reminders Service");

    let app_state = Arc::new(AppState::new(config.clone(), Arc::new(SystemClock)));

    // Durable storage stand-in: optional seed file
    if let Some(ref path) = config.scheduler.seed_events_path {
        match init::load_seed_events(Path::new(path)).await {
            Ok(events) => {
                init::seed_store(&app_state.store, events).await;
            }
            Err(e) => tracing::warn!("Failed to load seed events: {:?}", e),
        }
    }

    // Create shutdown notifier for background workers
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Spawn background workers (returns JoinHandles so we can await shutdown)
    let bg_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    let allowed_origin = config
        .server
        .frontend_url
        .parse::<HeaderValue>()
        .map_err(|e| anyhow::anyhow!("Invalid FRONTEND_URL for CORS: {}", e))?;

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Event CRUD and reminder actions
        .nest("/api/events", routes::events::router())
        // Reminder stream and manual triggers
        .nest("/api/notifications", routes::notifications::router())
        // Add shared state
        .with_state(app_state.clone())
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origin)
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::PUT,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                ])
                .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
        );

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(listener, app);

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_fut = async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {},
                        _ = term.recv() => {},
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to bind SIGTERM, waiting for Ctrl+C only: {}", e);
                    let _ = ctrl_c.await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received, notifying background workers");
        let _ = shutdown_tx_clone.send(());
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Covers the server exiting on its own. Pending reminder timers are abandoned here;
    // reconciliation rebuilds them on next start.
    let _ = shutdown_tx.send(());
    let shutdown_wait = Duration::from_secs(5);
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!(
            "Background workers did not exit within {}s",
            shutdown_wait.as_secs()
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
