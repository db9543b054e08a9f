use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::models::Event;

/// Payload pushed to subscribers when a reminder fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Start time of the event being announced.
    pub time: DateTime<Utc>,
}

impl From<&Event> for Reminder {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id,
            title: event.title.clone(),
            description: event.description.clone(),
            time: event.start_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("No subscribers are connected to receive reminders")]
    NoSubscribers,
}

/// Transport that receives reminders from the scheduler. Fire-and-forget:
/// the scheduler logs a failure but never retries it.
#[async_trait]
pub trait ReminderSink: Send + Sync + 'static {
    async fn publish(&self, reminder: &Reminder) -> Result<(), DeliveryError>;
}

/// Fan-out sink backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Reminder>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Reminder> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ReminderSink for BroadcastSink {
    async fn publish(&self, reminder: &Reminder) -> Result<(), DeliveryError> {
        let receivers = self
            .sender
            .send(reminder.clone())
            .map_err(|_| DeliveryError::NoSubscribers)?;
        tracing::debug!(
            "Published reminder for event {} to {} subscriber(s)",
            reminder.id,
            receivers
        );
        Ok(())
    }
}
