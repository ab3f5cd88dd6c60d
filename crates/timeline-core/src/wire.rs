//! JSON envelopes exchanged over the per-project WebSocket.
//!
//! Every frame is `{"type": <kind>, "data": {...}}`. Server envelopes carry a
//! millisecond `timestamp` inside `data`.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::event::{EventId, EventPatch, ProjectId, TimelineEvent, WireId};
use crate::now_millis;

/// Messages sent from a browser (or harness) to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Add(EventPayload),
    Update(EventPayload),
    Delete(DeletePayload),
}

impl ClientEnvelope {
    pub fn add(patch: EventPatch) -> Self {
        ClientEnvelope::Add(EventPayload { data: patch })
    }

    pub fn update(patch: EventPatch) -> Self {
        ClientEnvelope::Update(EventPayload { data: patch })
    }

    pub fn delete(id: EventId) -> Self {
        ClientEnvelope::Delete(DeletePayload {
            id: Some(id.into()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Add(_) => "add",
            ClientEnvelope::Update(_) => "update",
            ClientEnvelope::Delete(_) => "delete",
        }
    }
}

/// Event fields of an `add`/`update` request. The browser nests them under
/// `data.data`; flat `data` objects are accepted as well.
///
/// A `data` key always selects the nested shape, so a nested patch that fails
/// to decode is an error rather than an empty flat patch. An `id` next to the
/// nested object is used when the nested patch carries none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPayload {
    pub data: EventPatch,
}

impl<'de> Deserialize<'de> for EventPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        let nested = value.as_object_mut().and_then(|object| {
            let data = object.remove("data")?;
            Some((data, object.remove("id")))
        });

        let data = match nested {
            Some((data, outer_id)) => {
                let mut patch: EventPatch =
                    serde_json::from_value(data).map_err(de::Error::custom)?;
                if patch.id.is_none() {
                    patch.id = outer_id
                        .map(serde_json::from_value::<WireId>)
                        .transpose()
                        .map_err(de::Error::custom)?;
                }
                patch
            }
            None => serde_json::from_value(value).map_err(de::Error::custom)?,
        };
        Ok(EventPayload { data })
    }
}

/// Target of a `delete` request, either `{"id": ..}` or `{"data": {"id": ..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletePayload {
    pub id: Option<WireId>,
}

impl<'de> Deserialize<'de> for DeletePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Inner {
            #[serde(default)]
            id: Option<WireId>,
        }

        #[derive(Deserialize)]
        struct Outer {
            #[serde(default)]
            id: Option<WireId>,
            #[serde(default)]
            data: Option<Inner>,
        }

        let outer = Outer::deserialize(deserializer)?;
        let id = outer.id.or_else(|| outer.data.and_then(|inner| inner.id));
        Ok(DeletePayload { id })
    }
}

/// Messages sent from the server to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEnvelope {
    ConnectionSuccess(ConnectionSuccess),
    UserJoined(RosterChange),
    UserLeft(RosterChange),
    Add(EventBroadcast),
    Update(EventBroadcast),
    Delete(DeleteBroadcast),
    Error(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSuccess {
    pub project_id: ProjectId,
    pub username: String,
    pub active_users: Vec<String>,
    pub project_events: Vec<TimelineEvent>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterChange {
    pub username: String,
    pub active_users: Vec<String>,
    pub timestamp: i64,
}

/// Confirmed state of an added or updated event. Every session member,
/// including the originator, receives the same body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBroadcast {
    pub data: TimelineEvent,
    pub username: String,
    /// Placeholder id the originator used for its optimistic copy. Only
    /// present on `add`; never the id of the stored event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisional_id: Option<WireId>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBroadcast {
    pub data: DeletedRef,
    pub username: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRef {
    pub id: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    pub code: ErrorCode,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationFailed,
    NotFound,
    Conflict,
    StorageUnavailable,
    Malformed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::StorageUnavailable => "storage_unavailable",
            ErrorCode::Malformed => "malformed",
        }
    }
}

impl ServerEnvelope {
    pub fn connection_success(
        project_id: ProjectId,
        username: impl Into<String>,
        active_users: Vec<String>,
        project_events: Vec<TimelineEvent>,
    ) -> Self {
        ServerEnvelope::ConnectionSuccess(ConnectionSuccess {
            project_id,
            username: username.into(),
            active_users,
            project_events,
            timestamp: now_millis(),
        })
    }

    pub fn user_joined(username: impl Into<String>, active_users: Vec<String>) -> Self {
        ServerEnvelope::UserJoined(RosterChange {
            username: username.into(),
            active_users,
            timestamp: now_millis(),
        })
    }

    pub fn user_left(username: impl Into<String>, active_users: Vec<String>) -> Self {
        ServerEnvelope::UserLeft(RosterChange {
            username: username.into(),
            active_users,
            timestamp: now_millis(),
        })
    }

    pub fn added(
        event: TimelineEvent,
        username: impl Into<String>,
        provisional_id: Option<WireId>,
    ) -> Self {
        ServerEnvelope::Add(EventBroadcast {
            data: event,
            username: username.into(),
            provisional_id,
            timestamp: now_millis(),
        })
    }

    pub fn updated(event: TimelineEvent, username: impl Into<String>) -> Self {
        ServerEnvelope::Update(EventBroadcast {
            data: event,
            username: username.into(),
            provisional_id: None,
            timestamp: now_millis(),
        })
    }

    pub fn deleted(id: EventId, username: impl Into<String>) -> Self {
        ServerEnvelope::Delete(DeleteBroadcast {
            data: DeletedRef { id },
            username: username.into(),
            timestamp: now_millis(),
        })
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerEnvelope::Error(ErrorReport {
            message: message.into(),
            code,
            timestamp: now_millis(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::ConnectionSuccess(_) => "connection_success",
            ServerEnvelope::UserJoined(_) => "user_joined",
            ServerEnvelope::UserLeft(_) => "user_left",
            ServerEnvelope::Add(_) => "add",
            ServerEnvelope::Update(_) => "update",
            ServerEnvelope::Delete(_) => "delete",
            ServerEnvelope::Error(_) => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test_timeout::timeout]
    fn add_request_accepts_nested_and_flat_payloads() {
        let nested: ClientEnvelope = serde_json::from_value(json!({
            "type": "add",
            "data": { "data": { "id": "tmp-1", "label": "Kickoff", "start": "2025-06-01T09:00:00Z" } }
        }))
        .unwrap();
        let flat: ClientEnvelope = serde_json::from_value(json!({
            "type": "add",
            "data": { "id": "tmp-1", "label": "Kickoff", "start": "2025-06-01T09:00:00Z" }
        }))
        .unwrap();
        assert_eq!(nested, flat);

        let ClientEnvelope::Add(payload) = nested else {
            panic!("expected add");
        };
        assert_eq!(payload.data.id, Some(WireId::from("tmp-1")));
        assert_eq!(payload.data.start, Some(datetime!(2025-06-01 09:00 UTC)));
    }

    #[test_timeout::timeout]
    fn nested_patch_with_bad_field_fails_instead_of_decoding_empty() {
        let result = serde_json::from_value::<ClientEnvelope>(json!({
            "type": "update",
            "data": { "id": 1, "data": { "label": "new", "start": "not-a-date" } }
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<ClientEnvelope>(json!({
            "type": "update",
            "data": { "data": { "id": 1, "start": "not-a-date" } }
        }));
        assert!(result.is_err());
    }

    #[test_timeout::timeout]
    fn outer_id_fills_in_for_nested_patch() {
        let request: ClientEnvelope = serde_json::from_value(json!({
            "type": "update",
            "data": { "id": 3, "data": { "label": "Renamed" } }
        }))
        .unwrap();
        assert_eq!(
            request,
            ClientEnvelope::update(EventPatch::for_event(EventId(3)).with_label("Renamed"))
        );

        let request: ClientEnvelope = serde_json::from_value(json!({
            "type": "update",
            "data": { "id": 3, "data": { "id": 4 } }
        }))
        .unwrap();
        let ClientEnvelope::Update(payload) = request else {
            panic!("expected update");
        };
        assert_eq!(payload.data.id, Some(WireId::from(EventId(4))));
    }

    #[test_timeout::timeout]
    fn delete_request_reads_id_from_either_level() {
        let flat: ClientEnvelope =
            serde_json::from_value(json!({ "type": "delete", "data": { "id": 1 } })).unwrap();
        let nested: ClientEnvelope =
            serde_json::from_value(json!({ "type": "delete", "data": { "data": { "id": "1" } } }))
                .unwrap();
        assert_eq!(flat, ClientEnvelope::delete(EventId(1)));
        let ClientEnvelope::Delete(payload) = nested else {
            panic!("expected delete");
        };
        assert_eq!(payload.id, Some(WireId::Text("1".into())));
    }

    #[test_timeout::timeout]
    fn unknown_request_type_is_rejected() {
        let result = serde_json::from_value::<ClientEnvelope>(json!({ "type": "rename", "data": {} }));
        assert!(result.is_err());
    }

    #[test_timeout::timeout]
    fn add_broadcast_layout_matches_browser_expectations() {
        let event = TimelineEvent {
            id: EventId(1),
            label: "Kickoff".into(),
            start: datetime!(2025-06-01 09:00 UTC),
            end: None,
            details: String::new(),
        };
        let envelope = ServerEnvelope::added(event, "alice", Some(WireId::from("tmp-1")));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "add");
        assert_eq!(value["data"]["data"]["id"], 1);
        assert_eq!(value["data"]["provisionalId"], "tmp-1");
        assert_eq!(value["data"]["username"], "alice");
        assert!(value["data"]["timestamp"].is_i64());
    }

    #[test_timeout::timeout]
    fn connection_success_uses_camel_case_fields() {
        let envelope =
            ServerEnvelope::connection_success(ProjectId(42), "alice", vec!["bob".into()], vec![]);
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "connection_success");
        assert_eq!(value["data"]["projectId"], 42);
        assert_eq!(value["data"]["activeUsers"], json!(["bob"]));
        assert_eq!(value["data"]["projectEvents"], json!([]));
    }

    #[test_timeout::timeout]
    fn error_envelope_carries_code() {
        let value =
            serde_json::to_value(ServerEnvelope::error(ErrorCode::NotFound, "event 9 not found"))
                .unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "not_found");
    }
}
