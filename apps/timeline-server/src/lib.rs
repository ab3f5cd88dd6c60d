//! Live synchronization server for collaborative project timelines.
//!
//! Browsers connect to `/projects/{id}` over a WebSocket, receive the current
//! timeline and roster, and from then on send `add`/`update`/`delete`
//! requests. Every applied mutation is broadcast to all connections of the
//! project, the originator included.

pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod membership;
pub mod mutation;
pub mod routes;
pub mod session;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use tokio::signal;
use tracing::info;

use crate::{
    auth::Authenticator,
    config::ServerConfig,
    membership::{MembershipDirectory, RedisMembership, StaticMembership},
    routes::AppState,
    session::SessionRegistry,
    store::{EventStore, InMemoryEventStore, RedisEventStore},
};

/// Wires stores, membership and the registry for `config`. With a Redis URL
/// both events and memberships live in Redis; otherwise everything is kept
/// in process memory.
pub async fn build_state(config: &ServerConfig, metrics: PrometheusHandle) -> Result<Arc<AppState>> {
    let store: Arc<dyn EventStore>;
    let membership: Arc<dyn MembershipDirectory>;
    match &config.redis_url {
        Some(url) => {
            let client =
                redis::Client::open(url.as_str()).context("failed to create redis client")?;
            let manager = ConnectionManager::new(client)
                .await
                .context("failed to connect to redis")?;
            let directory = RedisMembership::new(manager.clone());
            directory
                .seed(&config.membership.grants)
                .await
                .context("failed to seed membership grants")?;
            info!(redis_url = %url, "using redis event store and membership");
            store = Arc::new(RedisEventStore::new(manager));
            if config.membership.open {
                membership = Arc::new(StaticMembership::open());
            } else {
                membership = Arc::new(directory);
            }
        }
        None => {
            info!(
                grants = config.membership.grants.len(),
                open_membership = config.membership.open,
                "using in-memory event store and membership"
            );
            store = Arc::new(InMemoryEventStore::new());
            membership = Arc::new(StaticMembership::from_config(&config.membership));
        }
    }

    Ok(Arc::new(AppState::new(
        SessionRegistry::new(config.session.clone()),
        Authenticator::new(config.auth.clone()),
        membership,
        store,
        metrics,
    )))
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = build_state(&config, metrics).await?;
    let recycler_handle = state.registry.spawn_recycler();
    let router = routes::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("timeline-server listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    recycler_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
