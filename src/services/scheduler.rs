//! Reminder scheduling engine.
//!
//! Every event with `pending` status and a start date far enough ahead owns exactly one
//! armed timer firing [`reminder_lead`] before it starts; a snoozed event owns one timer
//! firing [`snooze_interval`] after the snooze. Timers live in a min-heap ordered by fire
//! time; each armed entry carries a generation number that acts as its cancellation
//! handle, so superseded or cancelled entries are skipped when they reach the head.
//!
//! The fire path never trusts what was known at arming time: it re-reads the event from
//! the store and drops the fire if the event is gone or no longer awaiting delivery.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{Event, EventPatch, NotificationStatus};
use crate::db::repository::{EventObserver, EventStore, StoreError};
use crate::services::clock::Clock;
use crate::services::delivery::{DeliveryError, Reminder, ReminderSink};

/// How far ahead of an event's start the reminder fires.
pub fn reminder_lead() -> Duration {
    Duration::minutes(5)
}

/// Delay of a snoozed reminder, counted from the moment of snoozing.
pub fn snooze_interval() -> Duration {
    Duration::minutes(5)
}

// Upper bound on a single sleep of the fire loop, so wall-clock adjustments are picked up.
const MAX_IDLE: StdDuration = StdDuration::from_secs(60);

// Stale heap entries tolerated before the heap is rebuilt from the live timers.
const COMPACT_SLACK: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Reminder,
    Snooze,
}

/// Decision taken by [`NotificationScheduler::schedule_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Armed(DateTime<Utc>),
    /// Status is not `pending`. A snoozed event keeps its snooze timer; otherwise any
    /// previous timer was cancelled.
    Ineligible(NotificationStatus),
    /// The reminder time is not in the future; reminders are never sent late.
    Elapsed(DateTime<Utc>),
    /// The event is no longer stored.
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub armed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueuedFire {
    fire_at: DateTime<Utc>,
    generation: u64,
    event_id: Uuid,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    fire_at: DateTime<Utc>,
    generation: u64,
    kind: TimerKind,
}

#[derive(Debug, Default)]
struct TimerRegistry {
    armed: HashMap<Uuid, ArmedTimer>,
    queue: BinaryHeap<Reverse<QueuedFire>>,
    next_generation: u64,
}

impl TimerRegistry {
    /// Arm a timer, replacing any timer already held for the event.
    /// Returns whether a previous timer was superseded.
    fn arm(&mut self, event_id: Uuid, fire_at: DateTime<Utc>, kind: TimerKind) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;

        let superseded = self
            .armed
            .insert(
                event_id,
                ArmedTimer {
                    fire_at,
                    generation,
                    kind,
                },
            )
            .is_some();
        self.queue.push(Reverse(QueuedFire {
            fire_at,
            generation,
            event_id,
        }));
        self.compact();
        superseded
    }

    /// Safe to call for an event without a timer.
    fn cancel(&mut self, event_id: Uuid) -> bool {
        let cancelled = self.armed.remove(&event_id).is_some();
        if cancelled {
            self.compact();
        }
        cancelled
    }

    fn kind_of(&self, event_id: Uuid) -> Option<TimerKind> {
        self.armed.get(&event_id).map(|timer| timer.kind)
    }

    fn is_live(&self, entry: &QueuedFire) -> bool {
        self.armed
            .get(&entry.event_id)
            .is_some_and(|timer| timer.generation == entry.generation)
    }

    fn next_fire_at(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse(head)) = self.queue.peek().copied() {
            if self.is_live(&head) {
                return Some(head.fire_at);
            }
            self.queue.pop();
        }
        None
    }

    /// Disarm and return every live timer due at `now`, earliest first.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(Uuid, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek().copied() {
            if head.fire_at > now {
                break;
            }
            self.queue.pop();
            if let Some(timer) = self.armed.get(&head.event_id).copied() {
                if timer.generation == head.generation {
                    self.armed.remove(&head.event_id);
                    due.push((head.event_id, timer.kind));
                }
            }
        }
        due
    }

    fn compact(&mut self) {
        if self.queue.len() <= 2 * self.armed.len() + COMPACT_SLACK {
            return;
        }
        self.queue = self
            .armed
            .iter()
            .map(|(event_id, timer)| {
                Reverse(QueuedFire {
                    fire_at: timer.fire_at,
                    generation: timer.generation,
                    event_id: *event_id,
                })
            })
            .collect();
    }
}

/// Owns the event-id → timer mapping and fires reminders through a [`ReminderSink`].
pub struct NotificationScheduler {
    store: Arc<EventStore>,
    sink: Arc<dyn ReminderSink>,
    clock: Arc<dyn Clock>,
    timers: Mutex<TimerRegistry>,
    wakeup: Notify,
}

impl NotificationScheduler {
    /// Build the scheduler and attach it to `store` as its mutation observer.
    pub fn new(
        store: Arc<EventStore>,
        sink: Arc<dyn ReminderSink>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            store: store.clone(),
            sink,
            clock,
            timers: Mutex::new(TimerRegistry::default()),
            wakeup: Notify::new(),
        });

        let weak = Arc::downgrade(&scheduler);
        let observer: Weak<dyn EventObserver> = weak;
        store.attach_observer(observer);

        scheduler
    }

    /// Recompute the timer for `event`. Decides from the stored record rather than the
    /// passed snapshot, so a late or reordered call cannot resurrect a stale state.
    /// Calling this repeatedly is safe.
    pub async fn schedule_notification(&self, event: &Event) -> ScheduleOutcome {
        let mut timers = self.timers.lock().await;
        let Some(current) = self.store.find_by_id(event.id).await else {
            timers.cancel(event.id);
            debug!("Not scheduling reminder for event {}: deleted", event.id);
            return ScheduleOutcome::Removed;
        };

        match current.notification_status {
            NotificationStatus::Pending => {}
            NotificationStatus::Snoozed => {
                // The snooze timer is owned by the snooze operation; only a leftover
                // lead-time timer goes.
                if timers.kind_of(current.id) == Some(TimerKind::Reminder) {
                    timers.cancel(current.id);
                }
                return ScheduleOutcome::Ineligible(NotificationStatus::Snoozed);
            }
            status => {
                timers.cancel(current.id);
                debug!(
                    "Not scheduling reminder for event {}: status is {}",
                    current.id,
                    status.as_str()
                );
                return ScheduleOutcome::Ineligible(status);
            }
        }

        timers.cancel(current.id);
        let fire_at = current.start_date - reminder_lead();
        if fire_at <= self.clock.now() {
            debug!(
                "Not scheduling reminder for event {}: reminder time {} already passed",
                current.id, fire_at
            );
            return ScheduleOutcome::Elapsed(fire_at);
        }

        timers.arm(current.id, fire_at, TimerKind::Reminder);
        drop(timers);
        self.wakeup.notify_one();

        debug!("Scheduled reminder for event {} at {}", current.id, fire_at);
        ScheduleOutcome::Armed(fire_at)
    }

    /// Mark the event snoozed and re-arm its reminder [`snooze_interval`] from now,
    /// regardless of the start date.
    pub async fn snooze_notification(&self, event_id: Uuid) -> Result<Event, StoreError> {
        self.store
            .update(event_id, EventPatch::status(NotificationStatus::Snoozed))
            .await?;

        let event = self.arm_snooze(event_id).await?;
        if event.notification_status == NotificationStatus::Snoozed {
            info!("Snoozed reminder for event {}", event_id);
        }
        Ok(event)
    }

    /// Arm the snooze timer if the stored record is still snoozed. A dismiss, send or
    /// delete that landed after the status write wins, and no timer is armed.
    async fn arm_snooze(&self, event_id: Uuid) -> Result<Event, StoreError> {
        let mut timers = self.timers.lock().await;
        let Some(event) = self.store.find_by_id(event_id).await else {
            timers.cancel(event_id);
            return Err(StoreError::NotFound(event_id));
        };

        if event.notification_status != NotificationStatus::Snoozed {
            debug!(
                "Not arming snooze for event {}: status is now {}",
                event_id,
                event.notification_status.as_str()
            );
            return Ok(event);
        }

        let fire_at = self.clock.now() + snooze_interval();
        if timers.arm(event_id, fire_at, TimerKind::Snooze) {
            debug!("Snooze for event {} replaced an armed timer", event_id);
        }
        drop(timers);
        self.wakeup.notify_one();

        debug!("Snooze timer for event {} fires at {}", event_id, fire_at);
        Ok(event)
    }

    /// Mark the event dismissed and drop its timer.
    pub async fn dismiss_notification(&self, event_id: Uuid) -> Result<Event, StoreError> {
        let event = self
            .store
            .update(event_id, EventPatch::status(NotificationStatus::Dismissed))
            .await?;
        self.cancel_notification(event_id).await;

        info!("Dismissed reminder for event {}", event_id);
        Ok(event)
    }

    /// Drop the timer for `event_id` without touching its status.
    pub async fn cancel_notification(&self, event_id: Uuid) -> bool {
        let cancelled = self.timers.lock().await.cancel(event_id);
        if cancelled {
            debug!("Cancelled reminder timer for event {}", event_id);
        }
        cancelled
    }

    /// Deliver the reminder for `event_id` immediately, bypassing timing.
    ///
    /// The status flips to `sent` before delivery, so a delivery error leaves the
    /// event `sent` and is returned to the caller.
    pub async fn send_now(&self, event_id: Uuid) -> Result<Reminder, SchedulerError> {
        self.cancel_notification(event_id).await;

        let event = self
            .store
            .update(event_id, EventPatch::status(NotificationStatus::Sent))
            .await?;

        let reminder = Reminder::from(&event);
        info!("Sending reminder now for event {} ({})", event.id, event.title);
        self.sink.publish(&reminder).await?;
        Ok(reminder)
    }

    /// Send the reminder for the first stored event, if any.
    pub async fn send_test(&self) -> Result<Option<Reminder>, SchedulerError> {
        let Some(event) = self.store.find_all().await.into_iter().next() else {
            return Ok(None);
        };
        info!("Sending test reminder for event {}", event.title);
        self.send_now(event.id).await.map(Some)
    }

    /// Rebuild timers for everything currently in the store. Timers are not
    /// persisted, so this runs once at startup.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for event in self.store.find_all().await {
            match self.schedule_notification(&event).await {
                ScheduleOutcome::Armed(_) => report.armed += 1,
                ScheduleOutcome::Ineligible(_)
                | ScheduleOutcome::Elapsed(_)
                | ScheduleOutcome::Removed => report.skipped += 1,
            }
        }

        info!(
            "Reconciled reminder timers: {} armed, {} skipped",
            report.armed, report.skipped
        );
        report
    }

    /// Fire every timer due at the current clock time. Returns how many fired.
    pub async fn run_due(&self) -> usize {
        let now = self.clock.now();
        let due = self.timers.lock().await.take_due(now);

        let mut fired = 0;
        for (event_id, kind) in due {
            if self.on_fire(event_id, kind).await.is_some() {
                fired += 1;
            }
        }
        fired
    }

    async fn on_fire(&self, event_id: Uuid, kind: TimerKind) -> Option<Reminder> {
        // Status check and the flip to `sent` happen under one store write, so a
        // dismiss or a duplicate fire landing in between cannot be overwritten.
        let event = match self
            .store
            .update_if(
                event_id,
                |event| event.notification_status.awaits_delivery(),
                EventPatch::status(NotificationStatus::Sent),
            )
            .await
        {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(
                    "Dropping {:?} fire for event {}: not awaiting delivery",
                    kind, event_id
                );
                return None;
            }
            Err(e) => {
                debug!("Dropping {:?} fire for event {}: {}", kind, event_id, e);
                return None;
            }
        };

        let reminder = Reminder::from(&event);
        info!("Sending reminder for event {} ({})", event.id, event.title);
        if let Err(e) = self.sink.publish(&reminder).await {
            warn!("Failed to deliver reminder for event {}: {}", event.id, e);
        }
        Some(reminder)
    }

    async fn next_wait(&self) -> Option<StdDuration> {
        let next = self.timers.lock().await.next_fire_at()?;
        Some((next - self.clock.now()).to_std().unwrap_or(StdDuration::ZERO))
    }

    /// Fire loop: sleeps until the earliest timer, wakes early when a timer is
    /// armed, and exits when `shutdown` signals.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Notification scheduler started");

        loop {
            let wait = self
                .next_wait()
                .await
                .map_or(MAX_IDLE, |wait| wait.min(MAX_IDLE));

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Notification scheduler shutting down");
                    break;
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(wait) => {
                    self.run_due().await;
                }
            }
        }
    }

    pub async fn armed_fire_time(&self, event_id: Uuid) -> Option<DateTime<Utc>> {
        self.timers
            .lock()
            .await
            .armed
            .get(&event_id)
            .map(|timer| timer.fire_at)
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.armed.len()
    }
}

#[async_trait]
impl EventObserver for NotificationScheduler {
    async fn event_saved(&self, previous: Option<&Event>, current: &Event) {
        let timing_changed = match previous {
            None => true,
            Some(previous) => {
                previous.start_date != current.start_date
                    || previous.notification_status != current.notification_status
            }
        };

        if timing_changed {
            self.schedule_notification(current).await;
        }
    }

    async fn event_removed(&self, event_id: Uuid) {
        self.cancel_notification(event_id).await;
    }
}
