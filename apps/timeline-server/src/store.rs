//! Durable per-project event collections.
//!
//! Stores are partitioned by [`ProjectId`]: an event id that belongs to
//! another project is simply not found.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use timeline_core::{EventDraft, EventId, EventPatch, ProjectId, TimelineEvent, ValidationError};
use tracing::warn;

const LIST_ATTEMPTS: u32 = 3;
const LIST_RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error("event {0} already exists")]
    Conflict(EventId),
    #[error("event store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events of `project` in creation (id) order.
    async fn list(&self, project: ProjectId) -> Result<Vec<TimelineEvent>, StoreError>;

    /// Persists `draft` under a freshly assigned id.
    async fn create(&self, project: ProjectId, draft: EventDraft)
        -> Result<TimelineEvent, StoreError>;

    /// Merges `patch` into the stored event and returns the result.
    async fn patch(
        &self,
        project: ProjectId,
        id: EventId,
        patch: &EventPatch,
    ) -> Result<TimelineEvent, StoreError>;

    async fn delete(&self, project: ProjectId, id: EventId) -> Result<(), StoreError>;
}

/// Process-local store. Ids come from a single counter shared by all
/// projects, starting at 1.
#[derive(Debug)]
pub struct InMemoryEventStore {
    projects: RwLock<HashMap<ProjectId, BTreeMap<EventId, TimelineEvent>>>,
    next_id: AtomicU64,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            projects: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn event_count(&self, project: ProjectId) -> usize {
        self.projects
            .read()
            .get(&project)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn list(&self, project: ProjectId) -> Result<Vec<TimelineEvent>, StoreError> {
        Ok(self
            .projects
            .read()
            .get(&project)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(
        &self,
        project: ProjectId,
        draft: EventDraft,
    ) -> Result<TimelineEvent, StoreError> {
        draft.validate()?;
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = draft.into_event(id);
        let mut projects = self.projects.write();
        let events = projects.entry(project).or_default();
        if events.contains_key(&id) {
            return Err(StoreError::Conflict(id));
        }
        events.insert(id, event.clone());
        Ok(event)
    }

    async fn patch(
        &self,
        project: ProjectId,
        id: EventId,
        patch: &EventPatch,
    ) -> Result<TimelineEvent, StoreError> {
        let mut projects = self.projects.write();
        let stored = projects
            .get_mut(&project)
            .and_then(|events| events.get_mut(&id))
            .ok_or(StoreError::NotFound(id))?;
        let merged = stored.merged(patch)?;
        *stored = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, project: ProjectId, id: EventId) -> Result<(), StoreError> {
        let mut projects = self.projects.write();
        let events = projects.get_mut(&project).ok_or(StoreError::NotFound(id))?;
        events.remove(&id).ok_or(StoreError::NotFound(id))?;
        if events.is_empty() {
            projects.remove(&project);
        }
        Ok(())
    }
}

/// Redis layout: one hash per project (`field = id`, `value = event JSON`)
/// plus a global id counter.
#[derive(Clone)]
pub struct RedisEventStore {
    redis: ConnectionManager,
}

impl RedisEventStore {
    pub const NEXT_ID_KEY: &'static str = "timeline:events:next_id";

    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub fn events_key(project: ProjectId) -> String {
        format!("timeline:project:{}:events", project)
    }

    async fn load(&self, project: ProjectId) -> Result<Vec<TimelineEvent>, StoreError> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn.hvals(Self::events_key(project)).await?;
        let mut events = raw
            .iter()
            .map(|json| decode_event(json))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|event| event.id);
        Ok(events)
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn list(&self, project: ProjectId) -> Result<Vec<TimelineEvent>, StoreError> {
        let mut attempt = 1;
        loop {
            match self.load(project).await {
                Ok(events) => return Ok(events),
                Err(StoreError::Unavailable(reason)) if attempt < LIST_ATTEMPTS => {
                    warn!(
                        project_id = %project,
                        attempt,
                        error = %reason,
                        "event list failed; retrying"
                    );
                    tokio::time::sleep(LIST_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn create(
        &self,
        project: ProjectId,
        draft: EventDraft,
    ) -> Result<TimelineEvent, StoreError> {
        draft.validate()?;
        let mut conn = self.redis.clone();
        let id: u64 = conn.incr(Self::NEXT_ID_KEY, 1).await?;
        let event = draft.into_event(EventId(id));
        let inserted: bool = conn
            .hset_nx(Self::events_key(project), id, encode_event(&event)?)
            .await?;
        if !inserted {
            return Err(StoreError::Conflict(event.id));
        }
        Ok(event)
    }

    async fn patch(
        &self,
        project: ProjectId,
        id: EventId,
        patch: &EventPatch,
    ) -> Result<TimelineEvent, StoreError> {
        let mut conn = self.redis.clone();
        let key = Self::events_key(project);
        let raw: Option<String> = conn.hget(&key, id.0).await?;
        let stored = decode_event(&raw.ok_or(StoreError::NotFound(id))?)?;
        let merged = stored.merged(patch)?;
        conn.hset::<_, _, _, ()>(&key, id.0, encode_event(&merged)?)
            .await?;
        Ok(merged)
    }

    async fn delete(&self, project: ProjectId, id: EventId) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let removed: u64 = conn.hdel(Self::events_key(project), id.0).await?;
        if removed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

fn encode_event(event: &TimelineEvent) -> Result<String, StoreError> {
    serde_json::to_string(event)
        .map_err(|err| StoreError::Unavailable(format!("failed to encode event {}: {err}", event.id)))
}

fn decode_event(json: &str) -> Result<TimelineEvent, StoreError> {
    serde_json::from_str(json)
        .map_err(|err| StoreError::Unavailable(format!("corrupt stored event: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn kickoff() -> EventDraft {
        EventDraft::new("Kickoff", datetime!(2025-06-01 09:00 UTC))
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_assigns_increasing_ids_across_projects() {
        let store = InMemoryEventStore::new();
        let first = store.create(ProjectId(42), kickoff()).await.unwrap();
        let second = store.create(ProjectId(7), kickoff()).await.unwrap();
        let third = store.create(ProjectId(42), kickoff()).await.unwrap();
        assert_eq!(first.id, EventId(1));
        assert_eq!(second.id, EventId(2));
        assert_eq!(third.id, EventId(3));

        let listed: Vec<_> = store
            .list(ProjectId(42))
            .await
            .unwrap()
            .into_iter()
            .map(|event| event.id)
            .collect();
        assert_eq!(listed, vec![EventId(1), EventId(3)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_rejects_invalid_drafts() {
        let store = InMemoryEventStore::new();
        let result = store
            .create(ProjectId(1), EventDraft::new(" ", datetime!(2025-06-01 09:00 UTC)))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Invalid(ValidationError::EmptyLabel))
        ));
        assert_eq!(store.event_count(ProjectId(1)), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn patch_merges_and_is_project_scoped() {
        let store = InMemoryEventStore::new();
        let event = store.create(ProjectId(42), kickoff()).await.unwrap();

        let patch = EventPatch::for_event(event.id).with_details("agenda");
        let patched = store.patch(ProjectId(42), event.id, &patch).await.unwrap();
        assert_eq!(patched.label, "Kickoff");
        assert_eq!(patched.details, "agenda");
        assert_eq!(store.list(ProjectId(42)).await.unwrap(), vec![patched]);

        let foreign = store.patch(ProjectId(7), event.id, &patch).await;
        assert!(matches!(foreign, Err(StoreError::NotFound(id)) if id == event.id));
    }

    #[test_timeout::tokio_timeout_test]
    async fn invalid_patch_leaves_event_untouched() {
        let store = InMemoryEventStore::new();
        let event = store.create(ProjectId(42), kickoff()).await.unwrap();
        let patch = EventPatch::for_event(event.id).with_label("");
        assert!(store.patch(ProjectId(42), event.id, &patch).await.is_err());
        assert_eq!(store.list(ProjectId(42)).await.unwrap(), vec![event]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn delete_reports_missing_events() {
        let store = InMemoryEventStore::new();
        let event = store.create(ProjectId(42), kickoff()).await.unwrap();
        assert!(matches!(
            store.delete(ProjectId(7), event.id).await,
            Err(StoreError::NotFound(_))
        ));
        store.delete(ProjectId(42), event.id).await.unwrap();
        assert!(matches!(
            store.delete(ProjectId(42), event.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list(ProjectId(42)).await.unwrap().is_empty());
    }

    #[test_timeout::timeout]
    fn redis_key_layout() {
        assert_eq!(
            RedisEventStore::events_key(ProjectId(42)),
            "timeline:project:42:events"
        );
    }

    #[test_timeout::timeout]
    fn corrupt_payloads_surface_as_unavailable() {
        assert!(matches!(
            decode_event("{not json"),
            Err(StoreError::Unavailable(_))
        ));
    }
}
