//! Client-side replica of a project's timeline.
//!
//! The replica is an observable ordered map. Every change, whether typed by
//! the user or received from the server, goes through the same commit path
//! and is reported to listeners tagged with its [`Origin`]. Only
//! `Origin::Local` changes produce outbound requests; changes applied from a
//! server envelope carry `Origin::Server` and are never echoed back, which is
//! what keeps a replica from looping its own confirmations.

use std::collections::BTreeMap;

use thiserror::Error;
use time::OffsetDateTime;

use crate::event::{EventDraft, EventId, EventPatch, TimelineEvent, ValidationError, WireId};
use crate::wire::{ClientEnvelope, ServerEnvelope};

/// Key of an item in the replica. Confirmed items sort before provisional ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemKey {
    Confirmed(EventId),
    Provisional(String),
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Fields of a replica item. Mirrors [`TimelineEvent`] without the id so
/// provisional items can be represented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaItem {
    pub label: String,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
    pub details: String,
}

impl From<&TimelineEvent> for ReplicaItem {
    fn from(event: &TimelineEvent) -> Self {
        Self {
            label: event.label.clone(),
            start: event.start,
            end: event.end,
            details: event.details.clone(),
        }
    }
}

impl From<&EventDraft> for ReplicaItem {
    fn from(draft: &EventDraft) -> Self {
        Self {
            label: draft.label.clone(),
            start: draft.start,
            end: draft.end,
            details: draft.details.clone(),
        }
    }
}

impl ReplicaItem {
    fn to_event(&self, id: EventId) -> TimelineEvent {
        TimelineEvent {
            id,
            label: self.label.clone(),
            start: self.start,
            end: self.end,
            details: self.details.clone(),
        }
    }
}

/// A single committed change, as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaChange {
    pub kind: ChangeKind,
    pub key: ItemKey,
    /// Item state after the change; `None` for removals.
    pub item: Option<ReplicaItem>,
    /// Fields the change touched, for local updates.
    pub patch: Option<EventPatch>,
    pub origin: Origin,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("no confirmed event with id {0}")]
    UnknownEvent(EventId),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

type Listener = Box<dyn FnMut(&ReplicaChange) + Send>;

#[derive(Default)]
pub struct TimelineReplica {
    items: BTreeMap<ItemKey, ReplicaItem>,
    listeners: Vec<Listener>,
    outbox: Vec<ClientEnvelope>,
    active_users: Vec<String>,
    last_error: Option<String>,
    next_provisional: u64,
}

impl std::fmt::Debug for TimelineReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineReplica")
            .field("items", &self.items)
            .field("pending_requests", &self.outbox.len())
            .field("active_users", &self.active_users)
            .finish()
    }
}

impl TimelineReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked for every committed change.
    pub fn on_change<F>(&mut self, listener: F)
    where
        F: FnMut(&ReplicaChange) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Optimistically adds a user-created item under a provisional key and
    /// queues the matching `add` request.
    pub fn add_local(&mut self, draft: EventDraft) -> Result<ItemKey, ReplicaError> {
        draft.validate()?;
        self.next_provisional += 1;
        let key = ItemKey::Provisional(format!("tmp-{}", self.next_provisional));
        self.commit(ReplicaChange {
            kind: ChangeKind::Added,
            key: key.clone(),
            item: Some(ReplicaItem::from(&draft)),
            patch: None,
            origin: Origin::Local,
        });
        Ok(key)
    }

    /// Optimistically patches a confirmed item and queues an `update`
    /// carrying only the touched fields.
    pub fn update_local(&mut self, id: EventId, patch: EventPatch) -> Result<(), ReplicaError> {
        let key = ItemKey::Confirmed(id);
        let current = self.items.get(&key).ok_or(ReplicaError::UnknownEvent(id))?;
        let merged = current.to_event(id).merged(&patch)?;
        let patch = EventPatch {
            id: Some(id.into()),
            ..patch
        };
        self.commit(ReplicaChange {
            kind: ChangeKind::Updated,
            key,
            item: Some(ReplicaItem::from(&merged)),
            patch: Some(patch),
            origin: Origin::Local,
        });
        Ok(())
    }

    /// Optimistically removes a confirmed item and queues a `delete`.
    pub fn remove_local(&mut self, id: EventId) -> Result<(), ReplicaError> {
        let key = ItemKey::Confirmed(id);
        if !self.items.contains_key(&key) {
            return Err(ReplicaError::UnknownEvent(id));
        }
        self.commit(ReplicaChange {
            kind: ChangeKind::Removed,
            key,
            item: None,
            patch: None,
            origin: Origin::Local,
        });
        Ok(())
    }

    /// Reconciles the replica with an authoritative server envelope.
    pub fn apply_server(&mut self, envelope: &ServerEnvelope) {
        match envelope {
            ServerEnvelope::ConnectionSuccess(success) => {
                let stale: Vec<ItemKey> = self.items.keys().cloned().collect();
                for key in stale {
                    self.commit(removal(key));
                }
                for event in &success.project_events {
                    self.commit(confirmed(ChangeKind::Added, event));
                }
                self.active_users = success.active_users.clone();
            }
            ServerEnvelope::UserJoined(change) | ServerEnvelope::UserLeft(change) => {
                self.active_users = change.active_users.clone();
            }
            ServerEnvelope::Add(broadcast) => {
                if let Some(provisional) = broadcast.provisional_id.as_ref().map(WireId::as_key) {
                    let key = ItemKey::Provisional(provisional);
                    if self.items.contains_key(&key) {
                        self.commit(removal(key));
                    }
                }
                self.upsert_confirmed(&broadcast.data);
            }
            ServerEnvelope::Update(broadcast) => self.upsert_confirmed(&broadcast.data),
            ServerEnvelope::Delete(broadcast) => {
                let key = ItemKey::Confirmed(broadcast.data.id);
                if self.items.contains_key(&key) {
                    self.commit(removal(key));
                }
            }
            ServerEnvelope::Error(report) => {
                self.last_error = Some(report.message.clone());
            }
        }
    }

    /// Drains requests produced by local changes, in commit order.
    pub fn take_outbox(&mut self) -> Vec<ClientEnvelope> {
        std::mem::take(&mut self.outbox)
    }

    pub fn get(&self, key: &ItemKey) -> Option<&ReplicaItem> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn provisional_count(&self) -> usize {
        self.items
            .keys()
            .filter(|key| matches!(key, ItemKey::Provisional(_)))
            .count()
    }

    /// Confirmed events in id order.
    pub fn confirmed_events(&self) -> Vec<TimelineEvent> {
        self.items
            .iter()
            .filter_map(|(key, item)| match key {
                ItemKey::Confirmed(id) => Some(item.to_event(*id)),
                ItemKey::Provisional(_) => None,
            })
            .collect()
    }

    pub fn active_users(&self) -> &[String] {
        &self.active_users
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn upsert_confirmed(&mut self, event: &TimelineEvent) {
        let kind = if self.items.contains_key(&ItemKey::Confirmed(event.id)) {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        self.commit(confirmed(kind, event));
    }

    fn commit(&mut self, change: ReplicaChange) {
        match (&change.kind, &change.item) {
            (ChangeKind::Removed, _) | (_, None) => {
                self.items.remove(&change.key);
            }
            (_, Some(item)) => {
                self.items.insert(change.key.clone(), item.clone());
            }
        }

        for listener in &mut self.listeners {
            listener(&change);
        }

        if change.origin == Origin::Local {
            if let Some(request) = request_for(&change) {
                self.outbox.push(request);
            }
        }
    }
}

fn confirmed(kind: ChangeKind, event: &TimelineEvent) -> ReplicaChange {
    ReplicaChange {
        kind,
        key: ItemKey::Confirmed(event.id),
        item: Some(ReplicaItem::from(event)),
        patch: None,
        origin: Origin::Server,
    }
}

fn removal(key: ItemKey) -> ReplicaChange {
    ReplicaChange {
        kind: ChangeKind::Removed,
        key,
        item: None,
        patch: None,
        origin: Origin::Server,
    }
}

fn request_for(change: &ReplicaChange) -> Option<ClientEnvelope> {
    match (&change.kind, &change.key) {
        (ChangeKind::Added, ItemKey::Provisional(provisional)) => {
            let item = change.item.as_ref()?;
            let patch = EventPatch {
                id: Some(WireId::Text(provisional.clone())),
                label: Some(item.label.clone()),
                start: Some(item.start),
                end: item.end.map(Some),
                details: Some(item.details.clone()),
            };
            Some(ClientEnvelope::add(patch))
        }
        (ChangeKind::Updated, ItemKey::Confirmed(_)) => {
            change.patch.clone().map(ClientEnvelope::update)
        }
        (ChangeKind::Removed, ItemKey::Confirmed(id)) => Some(ClientEnvelope::delete(*id)),
        // provisional items are only known locally until the server confirms them
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::event::ProjectId;
    use time::macros::datetime;

    fn kickoff(id: u64) -> TimelineEvent {
        TimelineEvent {
            id: EventId(id),
            label: "Kickoff".into(),
            start: datetime!(2025-06-01 09:00 UTC),
            end: None,
            details: String::new(),
        }
    }

    #[test_timeout::timeout]
    fn local_add_queues_request_with_provisional_id() {
        let mut replica = TimelineReplica::new();
        let key = replica
            .add_local(EventDraft::new("Kickoff", datetime!(2025-06-01 09:00 UTC)))
            .unwrap();

        let outbox = replica.take_outbox();
        assert_eq!(outbox.len(), 1);
        let ClientEnvelope::Add(payload) = &outbox[0] else {
            panic!("expected add request");
        };
        let ItemKey::Provisional(provisional) = &key else {
            panic!("expected provisional key");
        };
        assert_eq!(payload.data.id, Some(WireId::Text(provisional.clone())));
        assert_eq!(replica.provisional_count(), 1);
    }

    #[test_timeout::timeout]
    fn server_confirmation_replaces_provisional_item() {
        let mut replica = TimelineReplica::new();
        let key = replica
            .add_local(EventDraft::new("Kickoff", datetime!(2025-06-01 09:00 UTC)))
            .unwrap();
        let ItemKey::Provisional(provisional) = key else {
            panic!("expected provisional key");
        };
        replica.take_outbox();

        replica.apply_server(&ServerEnvelope::added(
            kickoff(1),
            "alice",
            Some(WireId::Text(provisional)),
        ));

        assert_eq!(replica.provisional_count(), 0);
        assert_eq!(replica.confirmed_events(), vec![kickoff(1)]);
        assert!(replica.take_outbox().is_empty());
    }

    #[test_timeout::timeout]
    fn server_changes_never_produce_requests() {
        let origins = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&origins);
        let mut replica = TimelineReplica::new();
        replica.on_change(move |change| seen.lock().unwrap().push(change.origin));

        replica.apply_server(&ServerEnvelope::connection_success(
            ProjectId(1),
            "alice",
            vec![],
            vec![kickoff(1), kickoff(2)],
        ));
        replica.apply_server(&ServerEnvelope::updated(kickoff(1), "bob"));
        replica.apply_server(&ServerEnvelope::deleted(EventId(2), "bob"));

        assert!(replica.take_outbox().is_empty());
        assert!(origins.lock().unwrap().iter().all(|o| *o == Origin::Server));
        assert_eq!(replica.confirmed_events(), vec![kickoff(1)]);
    }

    #[test_timeout::timeout]
    fn local_update_sends_only_touched_fields() {
        let mut replica = TimelineReplica::new();
        replica.apply_server(&ServerEnvelope::added(kickoff(4), "bob", None));

        replica
            .update_local(EventId(4), EventPatch::default().with_details("agenda"))
            .unwrap();

        let outbox = replica.take_outbox();
        let ClientEnvelope::Update(payload) = &outbox[0] else {
            panic!("expected update request");
        };
        assert_eq!(payload.data.id, Some(WireId::Number(4)));
        assert_eq!(payload.data.details.as_deref(), Some("agenda"));
        assert!(payload.data.label.is_none());
        assert_eq!(
            replica.get(&ItemKey::Confirmed(EventId(4))).unwrap().details,
            "agenda"
        );
    }

    #[test_timeout::timeout]
    fn local_changes_to_unknown_events_are_rejected() {
        let mut replica = TimelineReplica::new();
        assert_eq!(
            replica.remove_local(EventId(5)),
            Err(ReplicaError::UnknownEvent(EventId(5)))
        );
        assert!(replica.take_outbox().is_empty());
    }

    #[test_timeout::timeout]
    fn snapshot_replaces_previous_contents() {
        let mut replica = TimelineReplica::new();
        replica.apply_server(&ServerEnvelope::added(kickoff(1), "bob", None));
        replica.apply_server(&ServerEnvelope::connection_success(
            ProjectId(1),
            "alice",
            vec!["bob".into()],
            vec![kickoff(2)],
        ));
        assert_eq!(replica.confirmed_events(), vec![kickoff(2)]);
        assert_eq!(replica.active_users(), ["bob".to_string()]);
    }
}
