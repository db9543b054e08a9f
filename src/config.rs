use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS. Read from env var `FRONTEND_URL`.
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Grace delay before the startup reconciliation pass runs.
    pub reconcile_delay_ms: u64,
    /// Buffer size of the reminder broadcast channel; slow subscribers lag past it.
    pub reminder_channel_capacity: usize,
    /// Optional JSON file with events to load into the store at startup.
    pub seed_events_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            scheduler: SchedulerConfig {
                reconcile_delay_ms: env::var("RECONCILE_DELAY_MS")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("RECONCILE_DELAY_MS".to_string()))?,
                reminder_channel_capacity: env::var("REMINDER_CHANNEL_CAPACITY")
                    .unwrap_or_else(|_| "256".to_string())
                    .parse()
                    .unwrap_or(256),
                seed_events_path: env::var("SEED_EVENTS_PATH")
                    .ok()
                    .filter(|path| !path.trim().is_empty()),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            scheduler: SchedulerConfig {
                reconcile_delay_ms: 1000,
                reminder_channel_capacity: 256,
                seed_events_path: None,
            },
        }
    }
}
