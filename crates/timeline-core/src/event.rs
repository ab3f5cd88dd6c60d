use std::{fmt, num::ParseIntError, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Identifier of the project a timeline belongs to. Sessions and stores are
/// partitioned by this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ProjectId)
    }
}

/// Server-assigned identifier of a timeline event, unique within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = WireId::deserialize(deserializer)?;
        EventId::try_from(&raw).map_err(serde::de::Error::custom)
    }
}

/// An id as it appears on the wire. Browsers send numbers, numeric strings or
/// arbitrary placeholder strings for not-yet-confirmed items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    /// Stable textual form, used to match provisional items on the client.
    pub fn as_key(&self) -> String {
        match self {
            WireId::Number(value) => value.to_string(),
            WireId::Text(value) => value.clone(),
        }
    }
}

impl From<EventId> for WireId {
    fn from(id: EventId) -> Self {
        WireId::Number(id.0)
    }
}

impl From<&str> for WireId {
    fn from(value: &str) -> Self {
        WireId::Text(value.to_owned())
    }
}

impl TryFrom<&WireId> for EventId {
    type Error = ValidationError;

    fn try_from(raw: &WireId) -> Result<Self, Self::Error> {
        match raw {
            WireId::Number(value) => Ok(EventId(*value)),
            WireId::Text(text) => text
                .trim()
                .parse()
                .map(EventId)
                .map_err(|_| ValidationError::MalformedId(text.clone())),
        }
    }
}

/// Reasons a client-supplied event or patch is rejected before it reaches a
/// store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("start instant is required")]
    MissingStart,
    #[error("end must not be before start")]
    EndBeforeStart,
    #[error("event id is required")]
    MissingId,
    #[error("event id {0:?} is not a valid identifier")]
    MalformedId(String),
}

/// Canonical timeline event as held by the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: EventId,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<OffsetDateTime>,
    #[serde(default)]
    pub details: String,
}

impl TimelineEvent {
    /// Applies a partial patch on top of this event. Fields absent from the
    /// patch keep their current value; the patch id is ignored.
    pub fn merged(&self, patch: &EventPatch) -> Result<TimelineEvent, ValidationError> {
        let mut next = self.clone();
        if let Some(label) = patch.label.as_deref() {
            next.label = normalize_label(label)?;
        }
        if let Some(start) = patch.start {
            next.start = start;
        }
        if let Some(end) = patch.end {
            next.end = end;
        }
        if let Some(details) = &patch.details {
            next.details = details.clone();
        }
        check_range(next.start, next.end)?;
        Ok(next)
    }
}

/// Validated input for creating a new event. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub label: String,
    pub start: OffsetDateTime,
    pub end: Option<OffsetDateTime>,
    pub details: String,
}

impl EventDraft {
    pub fn new(label: impl Into<String>, start: OffsetDateTime) -> Self {
        Self {
            label: label.into(),
            start,
            end: None,
            details: String::new(),
        }
    }

    pub fn with_end(mut self, end: OffsetDateTime) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Builds a draft from an `add` payload. Any id in the patch is a
    /// provisional client id and is not carried over.
    pub fn from_patch(patch: &EventPatch) -> Result<Self, ValidationError> {
        let label = normalize_label(patch.label.as_deref().unwrap_or_default())?;
        let start = patch.start.ok_or(ValidationError::MissingStart)?;
        let end = patch.end.flatten();
        check_range(start, end)?;
        Ok(Self {
            label,
            start,
            end,
            details: patch.details.clone().unwrap_or_default(),
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        normalize_label(&self.label)?;
        check_range(self.start, self.end)
    }

    pub fn into_event(self, id: EventId) -> TimelineEvent {
        TimelineEvent {
            id,
            label: self.label,
            start: self.start,
            end: self.end,
            details: self.details,
        }
    }

    /// Wire form of the draft, as sent in an `add` request.
    pub fn to_patch(&self) -> EventPatch {
        EventPatch {
            id: None,
            label: Some(self.label.clone()),
            start: Some(self.start),
            end: self.end.map(Some),
            details: Some(self.details.clone()),
        }
    }
}

/// Partial event fields carried by `add` and `update` requests.
///
/// `end` is tri-state: absent leaves the stored value alone, `null` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WireId>,
    #[serde(default, alias = "content", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub start: Option<OffsetDateTime>,
    #[serde(default, with = "patch_end", skip_serializing_if = "Option::is_none")]
    pub end: Option<Option<OffsetDateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EventPatch {
    pub fn for_event(id: EventId) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_start(mut self, start: OffsetDateTime) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: Option<OffsetDateTime>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Resolves the id this patch targets.
    pub fn target(&self) -> Result<EventId, ValidationError> {
        let raw = self.id.as_ref().ok_or(ValidationError::MissingId)?;
        EventId::try_from(raw)
    }

    /// Rejects a present-but-blank label without touching any stored state.
    pub fn check_label(&self) -> Result<(), ValidationError> {
        match self.label.as_deref() {
            Some(label) => normalize_label(label).map(|_| ()),
            None => Ok(()),
        }
    }
}

fn normalize_label(label: &str) -> Result<String, ValidationError> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        Err(ValidationError::EmptyLabel)
    } else {
        Ok(trimmed.to_owned())
    }
}

fn check_range(start: OffsetDateTime, end: Option<OffsetDateTime>) -> Result<(), ValidationError> {
    match end {
        Some(end) if end < start => Err(ValidationError::EndBeforeStart),
        _ => Ok(()),
    }
}

mod patch_end {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<Option<OffsetDateTime>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => time::serde::rfc3339::option::serialize(inner, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<OffsetDateTime>>, D::Error> {
        time::serde::rfc3339::option::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn kickoff() -> TimelineEvent {
        TimelineEvent {
            id: EventId(1),
            label: "Kickoff".into(),
            start: datetime!(2025-06-01 09:00 UTC),
            end: None,
            details: String::new(),
        }
    }

    #[test_timeout::timeout]
    fn event_ids_accept_numbers_and_numeric_strings() {
        let from_number: EventId = serde_json::from_str("7").unwrap();
        let from_text: EventId = serde_json::from_str("\"7\"").unwrap();
        assert_eq!(from_number, EventId(7));
        assert_eq!(from_text, EventId(7));
        assert!(serde_json::from_str::<EventId>("\"tmp-1\"").is_err());
    }

    #[test_timeout::timeout]
    fn draft_requires_non_blank_label() {
        let patch = EventPatch::default()
            .with_label("   ")
            .with_start(datetime!(2025-06-01 09:00 UTC));
        assert_eq!(
            EventDraft::from_patch(&patch),
            Err(ValidationError::EmptyLabel)
        );
    }

    #[test_timeout::timeout]
    fn draft_drops_provisional_id_and_trims_label() {
        let patch: EventPatch = serde_json::from_str(
            r#"{"id":"tmp-9","content":"  Kickoff ","start":"2025-06-01T09:00:00Z"}"#,
        )
        .unwrap();
        let draft = EventDraft::from_patch(&patch).unwrap();
        assert_eq!(draft.label, "Kickoff");
        assert_eq!(draft.into_event(EventId(3)).id, EventId(3));
    }

    #[test_timeout::timeout]
    fn draft_rejects_end_before_start() {
        let patch = EventPatch::default()
            .with_label("Review")
            .with_start(datetime!(2025-06-02 09:00 UTC))
            .with_end(Some(datetime!(2025-06-01 09:00 UTC)));
        assert_eq!(
            EventDraft::from_patch(&patch),
            Err(ValidationError::EndBeforeStart)
        );
    }

    #[test_timeout::timeout]
    fn merge_only_touches_present_fields() {
        let patch = EventPatch::for_event(EventId(1)).with_details("agenda");
        let merged = kickoff().merged(&patch).unwrap();
        assert_eq!(merged.label, "Kickoff");
        assert_eq!(merged.details, "agenda");
    }

    #[test_timeout::timeout]
    fn merge_distinguishes_absent_and_null_end() {
        let mut event = kickoff();
        event.end = Some(datetime!(2025-06-01 10:00 UTC));

        let untouched: EventPatch = serde_json::from_str(r#"{"id":1,"label":"Kickoff v2"}"#).unwrap();
        assert_eq!(event.merged(&untouched).unwrap().end, event.end);

        let cleared: EventPatch = serde_json::from_str(r#"{"id":1,"end":null}"#).unwrap();
        assert_eq!(cleared.end, Some(None));
        assert_eq!(event.merged(&cleared).unwrap().end, None);
    }

    #[test_timeout::timeout]
    fn merge_rejects_blank_label() {
        let patch = EventPatch::for_event(EventId(1)).with_label("\t");
        assert_eq!(kickoff().merged(&patch), Err(ValidationError::EmptyLabel));
    }

    #[test_timeout::timeout]
    fn patch_target_reports_missing_and_malformed_ids() {
        assert_eq!(EventPatch::default().target(), Err(ValidationError::MissingId));
        let patch = EventPatch {
            id: Some(WireId::from("abc")),
            ..EventPatch::default()
        };
        assert_eq!(
            patch.target(),
            Err(ValidationError::MalformedId("abc".into()))
        );
    }

    #[test_timeout::timeout]
    fn event_serializes_without_absent_end() {
        let value = serde_json::to_value(kickoff()).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["start"], "2025-06-01T09:00:00Z");
        assert!(value.get("end").is_none());
    }
}
