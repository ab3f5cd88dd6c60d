use std::sync::Arc;

use thiserror::Error;
use timeline_core::{
    ClientEnvelope, EventDraft, EventId, ErrorCode, ProjectId, ServerEnvelope, ValidationError,
};

use crate::{
    auth::Identity,
    store::{EventStore, StoreError},
};

/// Why a single client request was not applied. Reported to the originator
/// only.
#[derive(Debug, Error)]
pub enum MutationError {
    #[error(transparent)]
    ValidationFailed(#[from] ValidationError),
    #[error("event {0} not found")]
    NotFound(EventId),
    #[error("event {0} was modified concurrently")]
    Conflict(EventId),
    #[error("storage unavailable: {0}")]
    TransientIoFailure(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl MutationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MutationError::ValidationFailed(_) => ErrorCode::ValidationFailed,
            MutationError::NotFound(_) => ErrorCode::NotFound,
            MutationError::Conflict(_) => ErrorCode::Conflict,
            MutationError::TransientIoFailure(_) => ErrorCode::StorageUnavailable,
            MutationError::Malformed(_) => ErrorCode::Malformed,
        }
    }

    pub fn to_envelope(&self) -> ServerEnvelope {
        ServerEnvelope::error(self.code(), self.to_string())
    }
}

impl From<StoreError> for MutationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => MutationError::NotFound(id),
            StoreError::Conflict(id) => MutationError::Conflict(id),
            StoreError::Unavailable(reason) => MutationError::TransientIoFailure(reason),
            StoreError::Invalid(err) => MutationError::ValidationFailed(err),
        }
    }
}

/// Decodes one inbound text frame.
pub fn decode_request(frame: &str) -> Result<ClientEnvelope, MutationError> {
    serde_json::from_str(frame).map_err(|err| MutationError::Malformed(err.to_string()))
}

/// Applies client requests to the event store and produces the envelope to
/// broadcast. Callers hold the project's session lease for the duration of
/// [`MutationHandler::apply`], which is what orders mutations per project.
#[derive(Clone)]
pub struct MutationHandler {
    store: Arc<dyn EventStore>,
}

impl MutationHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn apply(
        &self,
        project: ProjectId,
        author: &Identity,
        request: ClientEnvelope,
    ) -> Result<ServerEnvelope, MutationError> {
        let username = author.display_name.as_str();
        match request {
            ClientEnvelope::Add(payload) => {
                let draft = EventDraft::from_patch(&payload.data)?;
                let event = self.store.create(project, draft).await?;
                Ok(ServerEnvelope::added(event, username, payload.data.id))
            }
            ClientEnvelope::Update(payload) => {
                let id = payload.data.target()?;
                payload.data.check_label()?;
                let event = self.store.patch(project, id, &payload.data).await?;
                Ok(ServerEnvelope::updated(event, username))
            }
            ClientEnvelope::Delete(payload) => {
                let raw = payload.id.as_ref().ok_or(ValidationError::MissingId)?;
                let id = EventId::try_from(raw)?;
                self.store.delete(project, id).await?;
                Ok(ServerEnvelope::deleted(id, username))
            }
        }
    }
}
