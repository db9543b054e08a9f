use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::{Event, EventPatch, NewEvent};
use crate::services::clock::Clock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Duplicate event detected with same title, date, and location")]
    Conflict,

    #[error("Event not found: {0}")]
    NotFound(Uuid),
}

/// Hook invoked after every successful write, once the store lock has been released.
#[async_trait]
pub trait EventObserver: Send + Sync {
    /// `previous` is `None` for a freshly created event.
    async fn event_saved(&self, previous: Option<&Event>, current: &Event);

    async fn event_removed(&self, event_id: Uuid);
}

/// In-memory event collection keyed by id.
///
/// Reads are plain projections over a snapshot. Writes stamp timestamps from the
/// injected [`Clock`] and then notify the attached [`EventObserver`] before returning,
/// so observer state never lags behind what a caller can read back.
#[derive(Debug)]
pub struct EventStore {
    events: RwLock<HashMap<Uuid, Event>>,
    clock: Arc<dyn Clock>,
    observer: OnceLock<Weak<dyn EventObserver>>,
}

impl EventStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            clock,
            observer: OnceLock::new(),
        }
    }

    /// Attach the mutation observer. Only the first attachment takes effect.
    pub fn attach_observer(&self, observer: Weak<dyn EventObserver>) -> bool {
        let attached = self.observer.set(observer).is_ok();
        if !attached {
            warn!("Event store already has an observer attached; ignoring");
        }
        attached
    }

    fn observer(&self) -> Option<Arc<dyn EventObserver>> {
        self.observer.get().and_then(Weak::upgrade)
    }

    pub async fn find_all(&self) -> Vec<Event> {
        let events = self.events.read().await;
        sorted(events.values().cloned().collect())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Option<Event> {
        self.events.read().await.get(&id).cloned()
    }

    /// Events whose start date falls inside `[start, end]`.
    pub async fn find_by_date_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Event> {
        let events = self.events.read().await;
        sorted(
            events
                .values()
                .filter(|e| e.start_date >= start && e.start_date <= end)
                .cloned()
                .collect(),
        )
    }

    /// Case-insensitive substring match over title, description and location.
    pub async fn search(&self, query: &str) -> Vec<Event> {
        let query = query.to_lowercase();
        let events = self.events.read().await;
        sorted(
            events
                .values()
                .filter(|e| {
                    e.title.to_lowercase().contains(&query)
                        || e.description.to_lowercase().contains(&query)
                        || e
                            .location
                            .as_deref()
                            .is_some_and(|l| l.to_lowercase().contains(&query))
                })
                .cloned()
                .collect(),
        )
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn create(&self, data: NewEvent) -> Result<Event, StoreError> {
        let event = {
            let mut events = self.events.write().await;

            if events.values().any(|existing| is_equivalent(existing, &data)) {
                return Err(StoreError::Conflict);
            }

            let now = self.clock.now();
            let event = Event {
                id: Uuid::new_v4(),
                title: data.title,
                description: data.description,
                start_date: data.start_date,
                end_date: data.end_date,
                location: data.location,
                attachments: data.attachments,
                notification_status: data.notification_status,
                created_at: now,
                updated_at: now,
            };
            events.insert(event.id, event.clone());
            event
        };

        debug!("Created event {} ({})", event.id, event.title);

        if let Some(observer) = self.observer() {
            observer.event_saved(None, &event).await;
        }

        Ok(event)
    }

    pub async fn update(&self, id: Uuid, patch: EventPatch) -> Result<Event, StoreError> {
        self.update_if(id, |_| true, patch)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    /// Apply `patch` only if `condition` holds for the stored record, checked under
    /// the write lock. Returns `Ok(None)` without writing when it does not hold.
    pub async fn update_if<F>(
        &self,
        id: Uuid,
        condition: F,
        patch: EventPatch,
    ) -> Result<Option<Event>, StoreError>
    where
        F: FnOnce(&Event) -> bool + Send,
    {
        let (previous, event) = {
            let mut events = self.events.write().await;
            let existing = events.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if !condition(existing) {
                return Ok(None);
            }

            let previous = existing.clone();
            patch.apply_to(existing);
            existing.updated_at = self.next_stamp(previous.updated_at);
            (previous, existing.clone())
        };

        if let Some(observer) = self.observer() {
            observer.event_saved(Some(&previous), &event).await;
        }

        Ok(Some(event))
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        let removed = self.events.write().await.remove(&id).is_some();

        if removed {
            debug!("Deleted event {}", id);
            if let Some(observer) = self.observer() {
                observer.event_removed(id).await;
            }
        }

        removed
    }

    // updated_at never goes backwards or repeats for a given record.
    fn next_stamp(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        let now = self.clock.now();
        if now > previous {
            now
        } else {
            previous + Duration::microseconds(1)
        }
    }
}

fn fold(text: Option<&str>) -> String {
    text.unwrap_or("").trim().to_lowercase()
}

fn is_equivalent(existing: &Event, candidate: &NewEvent) -> bool {
    fold(Some(&existing.title)) == fold(Some(&candidate.title))
        && existing.start_date == candidate.start_date
        && existing.end_date == candidate.end_date
        && fold(existing.location.as_deref()) == fold(candidate.location.as_deref())
}

fn sorted(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Attachment, AttachmentKind, NotificationStatus};
    use crate::services::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct RecordingObserver {
        saved: Mutex<Vec<(Option<NotificationStatus>, NotificationStatus)>>,
        removed: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl EventObserver for RecordingObserver {
        async fn event_saved(&self, previous: Option<&Event>, current: &Event) {
            self.saved.lock().unwrap().push((
                previous.map(|p| p.notification_status),
                current.notification_status,
            ));
        }

        async fn event_removed(&self, event_id: Uuid) {
            self.removed.lock().unwrap().push(event_id);
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn store() -> (EventStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (EventStore::new(clock.clone()), clock)
    }

    fn new_event(title: &str, location: Option<&str>) -> NewEvent {
        NewEvent {
            title: title.to_string(),
            description: "Quarterly planning".to_string(),
            start_date: start() + Duration::hours(2),
            end_date: Some(start() + Duration::hours(3)),
            location: location.map(str::to_string),
            attachments: vec![Attachment {
                kind: AttachmentKind::Image,
                url: "https://cdn.example.com/agenda.png".to_string(),
                name: "agenda".to_string(),
            }],
            notification_status: NotificationStatus::Pending,
        }
    }

    #[tokio::test]
    async fn create_then_find_returns_same_record() {
        let (store, _clock) = store();
        let data = new_event("Planning", Some("Room 4"));

        let created = assert_ok!(store.create(data.clone()).await);
        let found = store.find_by_id(created.id).await.unwrap();

        assert_eq!(found, created);
        assert_eq!(found.title, data.title);
        assert_eq!(found.attachments, data.attachments);
        assert_eq!(found.created_at, start());
        assert_eq!(found.updated_at, found.created_at);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_case_insensitively() {
        let (store, _clock) = store();
        assert_ok!(store.create(new_event("Planning", Some("Room 4"))).await);

        let err = assert_err!(store.create(new_event("  PLANNING ", Some("room 4"))).await);
        assert_eq!(err, StoreError::Conflict);
        assert_eq!(store.count().await, 1);

        // A different location is a different event.
        assert_ok!(store.create(new_event("Planning", Some("Room 5"))).await);
    }

    #[tokio::test]
    async fn missing_location_matches_empty_location() {
        let (store, _clock) = store();
        assert_ok!(store.create(new_event("Planning", None)).await);
        let err = assert_err!(store.create(new_event("Planning", Some(""))).await);
        assert_eq!(err, StoreError::Conflict);
    }

    #[tokio::test]
    async fn update_changes_only_given_fields_and_refreshes_timestamp() {
        let (store, clock) = store();
        let created = store.create(new_event("Planning", Some("Room 4"))).await.unwrap();

        clock.advance(Duration::seconds(30));
        let patch = EventPatch {
            description: Some("Moved agenda".to_string()),
            ..Default::default()
        };
        let updated = store.update(created.id, patch).await.unwrap();

        assert_eq!(updated.description, "Moved agenda");
        assert_eq!(updated.title, created.title);
        assert_eq!(updated.location, created.location);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(store.find_by_id(created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn update_stamp_is_strictly_later_even_without_clock_movement() {
        let (store, _clock) = store();
        let created = store.create(new_event("Planning", None)).await.unwrap();

        let first = store.update(created.id, EventPatch::default()).await.unwrap();
        let second = store.update(created.id, EventPatch::default()).await.unwrap();

        assert!(first.updated_at > created.updated_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn update_can_clear_nullable_fields() {
        let (store, _clock) = store();
        let created = store.create(new_event("Planning", Some("Room 4"))).await.unwrap();

        let patch: EventPatch = serde_json::from_str(r#"{"location":null,"endDate":null}"#).unwrap();
        let updated = store.update(created.id, patch).await.unwrap();

        assert_eq!(updated.location, None);
        assert_eq!(updated.end_date, None);
    }

    #[tokio::test]
    async fn update_and_delete_unknown_id() {
        let (store, _clock) = store();
        let id = Uuid::new_v4();

        let err = assert_err!(store.update(id, EventPatch::default()).await);
        assert_eq!(err, StoreError::NotFound(id));
        assert!(!store.delete(id).await);
    }

    #[tokio::test]
    async fn conditional_update_skips_write_when_condition_fails() {
        let (store, _clock) = store();
        let observer = Arc::new(RecordingObserver::default());
        let as_dyn: Arc<dyn EventObserver> = observer.clone();
        store.attach_observer(Arc::downgrade(&as_dyn));

        let event = store.create(new_event("Planning", None)).await.unwrap();
        store
            .update(event.id, EventPatch::status(NotificationStatus::Dismissed))
            .await
            .unwrap();
        let before = store.find_by_id(event.id).await.unwrap();

        let skipped = store
            .update_if(
                event.id,
                |e| e.notification_status.awaits_delivery(),
                EventPatch::status(NotificationStatus::Sent),
            )
            .await
            .unwrap();
        assert_eq!(skipped, None);
        assert_eq!(store.find_by_id(event.id).await.unwrap(), before);
        assert_eq!(observer.saved.lock().unwrap().len(), 2);

        let id = Uuid::new_v4();
        let err = assert_err!(store.update_if(id, |_| true, EventPatch::default()).await);
        assert_eq!(err, StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn search_matches_title_description_and_location() {
        let (store, _clock) = store();
        let a = store.create(new_event("Design Review", Some("Atrium"))).await.unwrap();
        let mut other = new_event("Lunch", None);
        other.description = "Team lunch".to_string();
        let b = store.create(other).await.unwrap();

        let ids = |events: Vec<Event>| events.into_iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids(store.search("REVIEW").await), vec![a.id]);
        assert_eq!(ids(store.search("atrium").await), vec![a.id]);
        assert_eq!(ids(store.search("team").await), vec![b.id]);
        assert!(store.search("nothing").await.is_empty());
    }

    #[tokio::test]
    async fn date_range_is_inclusive_on_start_date() {
        let (store, _clock) = store();
        let event = store.create(new_event("Planning", None)).await.unwrap();

        let at = event.start_date;
        assert_eq!(store.find_by_date_range(at, at).await.len(), 1);
        assert!(store
            .find_by_date_range(at + Duration::seconds(1), at + Duration::hours(1))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn find_all_is_ordered_by_creation() {
        let (store, clock) = store();
        let first = store.create(new_event("First", None)).await.unwrap();
        clock.advance(Duration::seconds(1));
        let second = store.create(new_event("Second", None)).await.unwrap();

        let all = store.find_all().await;
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn observer_sees_every_successful_write() {
        let (store, _clock) = store();
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn EventObserver> = {
            let as_dyn: Arc<dyn EventObserver> = observer.clone();
            Arc::downgrade(&as_dyn)
        };
        assert!(store.attach_observer(weak));

        let event = store.create(new_event("Planning", None)).await.unwrap();
        let _ = store.create(new_event("Planning", None)).await;
        store
            .update(event.id, EventPatch::status(NotificationStatus::Snoozed))
            .await
            .unwrap();
        assert!(store.delete(event.id).await);
        assert!(!store.delete(event.id).await);

        assert_eq!(
            *observer.saved.lock().unwrap(),
            vec![
                (None, NotificationStatus::Pending),
                (Some(NotificationStatus::Pending), NotificationStatus::Snoozed),
            ]
        );
        assert_eq!(*observer.removed.lock().unwrap(), vec![event.id]);
    }
}
