//! One task per WebSocket: join, frame loop, leave.

use std::{
    borrow::Cow,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use timeline_core::{now_millis, ErrorCode, ProjectId, ServerEnvelope};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::Identity,
    mutation::{decode_request, MutationError},
    routes::AppState,
};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

enum FrameOutcome {
    Continue,
    Detached,
}

/// Drives an upgraded connection until the client leaves, errors out, goes
/// idle or is evicted by the registry.
pub async fn run_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    project: ProjectId,
    identity: Identity,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Snapshot, registration and the join announcement happen under one
    // lease so no mutation can slip in between them.
    let mut lease = state.registry.lease(project).await;
    let events = match state.store.list(project).await {
        Ok(events) => events,
        Err(err) => {
            warn!(project_id = %project, error = %err, "failed to load timeline snapshot");
            drop(lease);
            counter!("timeline_join_rejected_total", 1, "reason" => "storage_unavailable");
            reject_after_upgrade(&mut ws_tx, ErrorCode::StorageUnavailable, err.to_string()).await;
            return;
        }
    };
    let registration = lease.register(identity.clone());
    let connection_id = registration.connection_id;
    let roster = lease.roster_for(&identity.subject);
    lease.send_to(
        connection_id,
        &ServerEnvelope::connection_success(project, identity.display_name.as_str(), roster, events),
    );
    if registration.newly_present {
        lease.announce_joined(connection_id);
    }
    let members = lease.len();
    drop(lease);

    counter!("timeline_connections_total", 1);
    increment_gauge!("timeline_connections_active", 1.0);
    info!(
        project_id = %project,
        connection_id = %connection_id,
        username = %identity.display_name,
        members,
        "timeline connection established"
    );

    let mut outbound = registration.receiver;
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let ping_every = state.registry.config().ping_interval;
    let mut ping = interval_at(tokio::time::Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let kick = registration.kick;
    let last_activity = registration.last_activity;
    let pinger = registration.sender;

    loop {
        tokio::select! {
            _ = kick.notified() => {
                debug!(project_id = %project, connection_id = %connection_id, "connection evicted");
                break;
            }
            _ = ping.tick() => {
                let _ = pinger.try_send(Message::Ping(Vec::new()));
            }
            frame = ws_rx.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!(
                            project_id = %project,
                            connection_id = %connection_id,
                            error = %err,
                            "error receiving frame"
                        );
                        break;
                    }
                    None => break,
                };
                last_activity.store(now_millis(), Ordering::Relaxed);

                let text = match message {
                    Message::Text(text) => text,
                    Message::Binary(bytes) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            let err = MutationError::Malformed("binary frame is not UTF-8".into());
                            report_to_originator(&state, project, connection_id, &err).await;
                            continue;
                        }
                    },
                    Message::Close(frame) => {
                        info!(
                            project_id = %project,
                            connection_id = %connection_id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                match handle_frame(&state, project, &identity, connection_id, &text).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Detached => break,
                }
            }
        }
    }

    leave(&state, project, connection_id).await;
    decrement_gauge!("timeline_connections_active", 1.0);

    drop(pinger);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        project_id = %project,
        connection_id = %connection_id,
        "timeline connection closed"
    );
}

async fn handle_frame(
    state: &AppState,
    project: ProjectId,
    identity: &Identity,
    connection_id: Uuid,
    text: &str,
) -> FrameOutcome {
    let Some(mut lease) = state.registry.existing(project).await else {
        return FrameOutcome::Detached;
    };
    if !lease.contains(connection_id) {
        return FrameOutcome::Detached;
    }

    let request = match decode_request(text) {
        Ok(request) => request,
        Err(err) => {
            record_rejection("unknown", &err);
            lease.send_to(connection_id, &err.to_envelope());
            return FrameOutcome::Continue;
        }
    };

    let kind = request.kind();
    let started = Instant::now();
    match state.mutations.apply(project, identity, request).await {
        Ok(envelope) => {
            let report = lease.broadcast(&envelope);
            counter!("timeline_mutations_applied_total", 1, "kind" => kind);
            histogram!(
                "timeline_mutation_duration_ms",
                started.elapsed().as_secs_f64() * 1000.0,
                "kind" => kind
            );
            debug!(
                project_id = %project,
                connection_id = %connection_id,
                kind,
                delivered = report.delivered,
                evicted = report.evicted,
                "mutation applied"
            );
        }
        Err(err) => {
            record_rejection(kind, &err);
            debug!(
                project_id = %project,
                connection_id = %connection_id,
                kind,
                error = %err,
                "mutation rejected"
            );
            lease.send_to(connection_id, &err.to_envelope());
        }
    }

    if lease.contains(connection_id) {
        FrameOutcome::Continue
    } else {
        FrameOutcome::Detached
    }
}

async fn report_to_originator(
    state: &AppState,
    project: ProjectId,
    connection_id: Uuid,
    err: &MutationError,
) {
    record_rejection("unknown", err);
    if let Some(mut lease) = state.registry.existing(project).await {
        lease.send_to(connection_id, &err.to_envelope());
    }
}

async fn leave(state: &AppState, project: ProjectId, connection_id: Uuid) {
    let Some(mut lease) = state.registry.existing(project).await else {
        return;
    };
    // `None` means the registry already evicted this connection and
    // announced the departure itself.
    if let Some(departure) = lease.deregister(connection_id) {
        if departure.last_for_identity {
            let mut report = Default::default();
            lease.announce_departures(vec![departure.identity], &mut report);
        }
    }
}

async fn reject_after_upgrade(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: ErrorCode,
    reason: String,
) {
    if let Ok(text) = ServerEnvelope::error(code, reason).to_json() {
        let _ = ws_tx.send(Message::Text(text)).await;
    }
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::AGAIN,
            reason: Cow::Borrowed("timeline unavailable"),
        })))
        .await;
}

fn record_rejection(kind: &'static str, err: &MutationError) {
    counter!(
        "timeline_mutations_rejected_total",
        1,
        "kind" => kind,
        "code" => err.code().as_str()
    );
}
