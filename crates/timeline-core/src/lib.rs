//! Core primitives shared by the timeline server and its clients.
//!
//! This crate intentionally keeps dependencies light so that the server, the
//! client harness and any test tooling consume a single source of truth for
//! the event model, the wire envelopes and the client-side replica.

pub mod event;
pub mod replica;
pub mod wire;

pub use event::{
    EventDraft, EventId, EventPatch, ProjectId, TimelineEvent, ValidationError, WireId,
};
pub use replica::{ChangeKind, ItemKey, Origin, ReplicaChange, ReplicaError, ReplicaItem, TimelineReplica};
pub use wire::{
    ClientEnvelope, ConnectionSuccess, DeleteBroadcast, DeletePayload, DeletedRef, ErrorCode,
    ErrorReport, EventBroadcast, EventPayload, RosterChange, ServerEnvelope,
};

/// Milliseconds since the Unix epoch, used for envelope timestamps.
pub fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as i64
}
