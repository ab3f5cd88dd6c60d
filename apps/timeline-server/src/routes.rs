use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use timeline_core::ProjectId;
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn, Instrument};

use crate::{
    auth::{Authenticator, Identity},
    lifecycle::run_connection,
    membership::MembershipDirectory,
    mutation::MutationHandler,
    session::SessionRegistry,
    store::EventStore,
};

pub struct AppState {
    pub registry: SessionRegistry,
    pub authenticator: Authenticator,
    pub membership: Arc<dyn MembershipDirectory>,
    pub store: Arc<dyn EventStore>,
    pub mutations: MutationHandler,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        authenticator: Authenticator,
        membership: Arc<dyn MembershipDirectory>,
        store: Arc<dyn EventStore>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            registry,
            authenticator,
            membership,
            mutations: MutationHandler::new(Arc::clone(&store)),
            store,
            metrics,
        }
    }

    async fn stats(&self) -> StatsResponse {
        let snapshot = self.registry.snapshot().await;
        let mut active_connections = 0usize;
        let mut identities = std::collections::BTreeSet::new();
        let mut sessions = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            active_connections += entry.connections;
            identities.extend(entry.identities.iter().cloned());
            sessions.push(SessionStatsEntry {
                project_id: entry.project,
                connections: entry.connections,
                identities: entry.identities,
            });
        }

        StatsResponse {
            active_sessions: sessions.len(),
            active_connections,
            distinct_identities: identities.len(),
            sessions,
        }
    }

    /// Resolves the caller and checks project membership. Everything here
    /// happens before the upgrade, so a refused caller is never registered.
    async fn admit(&self, project: ProjectId, token: Option<&str>) -> Result<Identity, Rejection> {
        let identity = self
            .authenticator
            .verify(token.unwrap_or_default())
            .map_err(|err| {
                warn!(project_id = %project, error = %err, "credential rejected");
                Rejection::new(StatusCode::UNAUTHORIZED, err.metric_label(), err.to_string())
            })?;

        match self.membership.is_member(project, &identity.subject).await {
            Ok(true) => Ok(identity),
            Ok(false) => Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "not_a_member",
                format!("{} is not a member of project {}", identity.subject, project),
            )),
            Err(err) => {
                warn!(project_id = %project, error = %err, "membership lookup failed");
                Err(Rejection::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "membership_unavailable",
                    err.to_string(),
                ))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    active_connections: usize,
    distinct_identities: usize,
    sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
struct SessionStatsEntry {
    project_id: ProjectId,
    connections: usize,
    identities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

struct Rejection {
    status: StatusCode,
    metric: &'static str,
    reason: String,
}

impl Rejection {
    fn new(status: StatusCode, metric: &'static str, reason: String) -> Self {
        Self {
            status,
            metric,
            reason,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        counter!("timeline_join_rejected_total", 1, "reason" => self.metric);
        (
            self.status,
            Json(json!({ "success": false, "reason": self.reason })),
        )
            .into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/projects/:project_id", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats().await)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<u64>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let project = ProjectId(project_id);
    let token = query.token.or_else(|| bearer_token(&headers));

    match state.admit(project, token.as_deref()).await {
        Ok(identity) => {
            let span = info_span!(
                "timeline_connection",
                project_id = %project,
                username = %identity.display_name
            );
            ws.on_upgrade(move |socket| {
                run_connection(socket, state, project, identity).instrument(span)
            })
        }
        Err(rejection) => rejection.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test_timeout::timeout]
    fn bearer_token_is_read_from_authorization_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def".to_string()));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer   "));
        assert_eq!(bearer_token(&headers), None);
    }
}
