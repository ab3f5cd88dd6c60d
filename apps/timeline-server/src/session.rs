//! Per-project session registry and broadcast fan-out.
//!
//! Each project with at least one live connection owns a [`SessionMembers`]
//! behind a tokio mutex. Holding a [`SessionLease`] is what serializes a
//! project: joins, mutations and leaves all run while the lease is held, so
//! the order in which leases are taken is the order every member observes.

use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use slab::Slab;
use timeline_core::{now_millis, ProjectId, ServerEnvelope};
use tokio::{
    sync::{mpsc, mpsc::error::TrySendError, Mutex, Notify, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;

const DEFAULT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub per_connection_buffer: usize,
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            per_connection_buffer: DEFAULT_CHANNEL_DEPTH,
            idle_timeout: Duration::from_secs(120),
            recycle_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<ProjectId, Arc<Mutex<SessionMembers>>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Locks the session of `project`, creating it if needed.
    pub async fn lease(&self, project: ProjectId) -> SessionLease {
        loop {
            let mut created = false;
            let session = match self.inner.sessions.entry(project) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let session = Arc::new(Mutex::new(SessionMembers::new(
                        project,
                        self.inner.config.per_connection_buffer,
                    )));
                    entry.insert(Arc::clone(&session));
                    created = true;
                    session
                }
            };
            if created {
                gauge!("timeline_sessions_active", self.inner.sessions.len() as f64);
                debug!(project_id = %project, "session created");
            }

            if let Some(lease) = self.acquire(session).await {
                return lease;
            }
            // Raced with the teardown of the previous session; the map no
            // longer holds it, so the next round creates a fresh one.
            tokio::task::yield_now().await;
        }
    }

    /// Locks the session of `project` only if one exists.
    pub async fn existing(&self, project: ProjectId) -> Option<SessionLease> {
        let session = self
            .inner
            .sessions
            .get(&project)
            .map(|entry| Arc::clone(entry.value()))?;
        self.acquire(session).await
    }

    async fn acquire(&self, session: Arc<Mutex<SessionMembers>>) -> Option<SessionLease> {
        let guard = Arc::clone(&session).lock_owned().await;
        if guard.closed {
            return None;
        }
        Some(SessionLease {
            registry: self.clone(),
            session,
            guard,
        })
    }

    /// Drops members that have been silent for longer than the idle timeout
    /// and announces the resulting departures. Returns how many connections
    /// were closed.
    pub async fn force_close_idle(&self, now: i64) -> usize {
        let timeout_ms = self.inner.config.idle_timeout.as_millis() as i64;
        let mut pruned = 0usize;

        for project in self.project_ids() {
            let Some(mut lease) = self.existing(project).await else {
                continue;
            };

            let idle: Vec<Uuid> = lease
                .slab
                .iter()
                .filter(|(_, member)| {
                    now.saturating_sub(member.last_activity.load(Ordering::Relaxed)) > timeout_ms
                })
                .map(|(_, member)| member.id)
                .collect();

            let mut departed = Vec::new();
            for connection_id in idle {
                let Some(index) = lease.index_map.get(&connection_id).copied() else {
                    continue;
                };
                let _ = lease.slab[index]
                    .sender
                    .try_send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: Cow::Borrowed("idle timeout"),
                    })));
                if let Some(departure) = lease.evict(index) {
                    info!(
                        project_id = %project,
                        connection_id = %connection_id,
                        "closing idle connection"
                    );
                    counter!("timeline_idle_pruned_total", 1);
                    pruned += 1;
                    if departure.last_for_identity {
                        departed.push(departure.identity);
                    }
                }
            }

            let mut report = BroadcastReport::default();
            lease.announce_departures(departed, &mut report);
        }

        pruned
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut snapshots = Vec::new();
        for project in self.project_ids() {
            let Some(session) = self
                .inner
                .sessions
                .get(&project)
                .map(|entry| Arc::clone(entry.value()))
            else {
                continue;
            };
            let members = session.lock().await;
            if members.closed {
                continue;
            }
            snapshots.push(SessionSnapshot {
                project,
                connections: members.len(),
                identities: members.list_members(),
            });
        }
        snapshots.sort_by_key(|snapshot| snapshot.project);
        snapshots
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let pruned = registry.force_close_idle(now_millis()).await;
                if pruned > 0 {
                    debug!(pruned, "idle recycler pass finished");
                }
            }
        })
    }

    fn project_ids(&self) -> Vec<ProjectId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    fn discard(&self, project: ProjectId, session: &Arc<Mutex<SessionMembers>>) {
        if self
            .inner
            .sessions
            .remove_if(&project, |_, current| Arc::ptr_eq(current, session))
            .is_some()
        {
            gauge!("timeline_sessions_active", self.inner.sessions.len() as f64);
            debug!(project_id = %project, "session discarded");
        }
    }
}

/// Exclusive access to one project's session. Dropping the last lease on an
/// empty session removes it from the registry.
pub struct SessionLease {
    registry: SessionRegistry,
    session: Arc<Mutex<SessionMembers>>,
    guard: OwnedMutexGuard<SessionMembers>,
}

impl Deref for SessionLease {
    type Target = SessionMembers;

    fn deref(&self) -> &SessionMembers {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut SessionMembers {
        &mut self.guard
    }
}

impl Drop for SessionLease {
    // The guard field is released after this body runs, so a waiter never
    // sees the session before it is marked closed.
    fn drop(&mut self) {
        if self.guard.is_empty() {
            self.guard.closed = true;
            let project = self.guard.project;
            self.registry.discard(project, &self.session);
        }
    }
}

/// Handed to a connection when it joins.
pub struct Registration {
    pub connection_id: Uuid,
    pub receiver: mpsc::Receiver<Message>,
    /// Clone of the member's outbound queue, for pings.
    pub sender: mpsc::Sender<Message>,
    /// Notified when the registry evicts this connection.
    pub kick: Arc<Notify>,
    pub last_activity: Arc<AtomicI64>,
    /// Whether this is the identity's first live connection in the session.
    pub newly_present: bool,
}

pub struct Departure {
    pub identity: Identity,
    /// No other connection of the same identity remains in the session.
    pub last_for_identity: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

pub struct SessionSnapshot {
    pub project: ProjectId,
    pub connections: usize,
    pub identities: Vec<String>,
}

pub struct SessionMembers {
    project: ProjectId,
    buffer: usize,
    slab: Slab<MemberEntry>,
    index_map: HashMap<Uuid, usize>,
    closed: bool,
}

struct MemberEntry {
    id: Uuid,
    identity: Identity,
    sender: mpsc::Sender<Message>,
    kick: Arc<Notify>,
    last_activity: Arc<AtomicI64>,
}

impl SessionMembers {
    fn new(project: ProjectId, buffer: usize) -> Self {
        Self {
            project,
            buffer: buffer.max(1),
            slab: Slab::new(),
            index_map: HashMap::new(),
            closed: false,
        }
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.index_map.contains_key(&connection_id)
    }

    pub fn register(&mut self, identity: Identity) -> Registration {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let connection_id = Uuid::new_v4();
        let newly_present = !self.is_present(&identity.subject);
        let kick = Arc::new(Notify::new());
        let last_activity = Arc::new(AtomicI64::new(now_millis()));

        let index = self.slab.insert(MemberEntry {
            id: connection_id,
            identity,
            sender: sender.clone(),
            kick: Arc::clone(&kick),
            last_activity: Arc::clone(&last_activity),
        });
        self.index_map.insert(connection_id, index);

        Registration {
            connection_id,
            receiver,
            sender,
            kick,
            last_activity,
            newly_present,
        }
    }

    /// Removes a connection. `None` if it was already gone.
    pub fn deregister(&mut self, connection_id: Uuid) -> Option<Departure> {
        let index = self.index_map.get(&connection_id).copied()?;
        self.evict(index)
    }

    /// Display names of the present identities, one per subject, sorted.
    pub fn list_members(&self) -> Vec<String> {
        roster_without(&self.presence(), None)
    }

    /// The roster as shown to the identity with subject `viewer`, who is left
    /// out of it.
    pub fn roster_for(&self, viewer: &str) -> Vec<String> {
        roster_without(&self.presence(), Some(viewer))
    }

    /// Sends `envelope` to every member, the originator included. Members
    /// whose queue is full or closed are evicted and their departure is
    /// announced to the rest.
    pub fn broadcast(&mut self, envelope: &ServerEnvelope) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(text) = encode(envelope) else {
            return report;
        };
        let message = Message::Text(text);
        let departed = self.deliver(None, |_| Some(message.clone()), &mut report);
        self.announce_departures(departed, &mut report);
        report
    }

    /// Sends `envelope` to one connection only. Returns `false` when the
    /// connection is gone or had to be evicted.
    pub fn send_to(&mut self, connection_id: Uuid, envelope: &ServerEnvelope) -> bool {
        let Some(index) = self.index_map.get(&connection_id).copied() else {
            return false;
        };
        let Some(text) = encode(envelope) else {
            return false;
        };
        if self.slab[index].sender.try_send(Message::Text(text)).is_ok() {
            return true;
        }
        let departed: Vec<Identity> = self
            .evict(index)
            .filter(|departure| departure.last_for_identity)
            .map(|departure| departure.identity)
            .into_iter()
            .collect();
        let mut report = BroadcastReport::default();
        self.announce_departures(departed, &mut report);
        false
    }

    /// Tells every other member that the identity behind `connection_id`
    /// arrived.
    pub fn announce_joined(&mut self, connection_id: Uuid) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(index) = self.index_map.get(&connection_id).copied() else {
            return report;
        };
        let username = self.slab[index].identity.display_name.clone();
        let presence = self.presence();
        let departed = self.deliver(
            Some(connection_id),
            |member| {
                encode(&ServerEnvelope::user_joined(
                    username.as_str(),
                    roster_without(&presence, Some(&member.identity.subject)),
                ))
                .map(Message::Text)
            },
            &mut report,
        );
        self.announce_departures(departed, &mut report);
        report
    }

    /// Broadcasts `user_left` for each identity in `departed`. Evictions
    /// caused along the way are announced as well.
    pub fn announce_departures(&mut self, mut departed: Vec<Identity>, report: &mut BroadcastReport) {
        while let Some(identity) = departed.pop() {
            info!(
                project_id = %self.project,
                username = %identity.display_name,
                "identity left session"
            );
            let presence = self.presence();
            let more = self.deliver(
                None,
                |member| {
                    encode(&ServerEnvelope::user_left(
                        identity.display_name.as_str(),
                        roster_without(&presence, Some(&member.identity.subject)),
                    ))
                    .map(Message::Text)
                },
                report,
            );
            departed.extend(more);
        }
    }

    fn deliver<F>(
        &mut self,
        skip: Option<Uuid>,
        mut render: F,
        report: &mut BroadcastReport,
    ) -> Vec<Identity>
    where
        F: FnMut(&MemberEntry) -> Option<Message>,
    {
        let mut failed = Vec::new();
        let mut delivered = 0usize;
        for (index, member) in self.slab.iter() {
            if Some(member.id) == skip {
                continue;
            }
            let Some(message) = render(member) else {
                continue;
            };
            match member.sender.try_send(message) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        project_id = %self.project,
                        connection_id = %member.id,
                        "outbound queue full; evicting connection"
                    );
                    failed.push(index);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        project_id = %self.project,
                        connection_id = %member.id,
                        "outbound queue closed; evicting connection"
                    );
                    failed.push(index);
                }
            }
        }

        report.delivered += delivered;
        counter!("timeline_broadcast_delivered_total", delivered as u64);

        let mut departed = Vec::new();
        for index in failed {
            report.evicted += 1;
            counter!("timeline_broadcast_evicted_total", 1);
            if let Some(departure) = self.evict(index) {
                if departure.last_for_identity {
                    departed.push(departure.identity);
                }
            }
        }
        departed
    }

    fn evict(&mut self, index: usize) -> Option<Departure> {
        let member = self.slab.try_remove(index)?;
        self.index_map.remove(&member.id);
        member.kick.notify_one();
        let last_for_identity = !self.is_present(&member.identity.subject);
        Some(Departure {
            identity: member.identity,
            last_for_identity,
        })
    }

    /// Subject to display name for every identity with a live connection.
    fn presence(&self) -> BTreeMap<String, String> {
        self.slab
            .iter()
            .map(|(_, member)| {
                (
                    member.identity.subject.clone(),
                    member.identity.display_name.clone(),
                )
            })
            .collect()
    }

    fn is_present(&self, subject: &str) -> bool {
        self.slab
            .iter()
            .any(|(_, member)| member.identity.subject == subject)
    }
}

fn roster_without(presence: &BTreeMap<String, String>, viewer: Option<&str>) -> Vec<String> {
    let mut roster: Vec<String> = presence
        .iter()
        .filter(|(subject, _)| Some(subject.as_str()) != viewer)
        .map(|(_, name)| name.clone())
        .collect();
    roster.sort();
    roster
}

fn encode(envelope: &ServerEnvelope) -> Option<String> {
    match envelope.to_json() {
        Ok(text) => Some(text),
        Err(err) => {
            warn!(kind = envelope.kind(), error = %err, "failed to encode envelope");
            None
        }
    }
}
