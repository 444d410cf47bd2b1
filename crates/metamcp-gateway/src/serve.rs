//! Startup orchestration and graceful shutdown.
//!
//! Boot order: bind the listener, start the background reapers, then (after
//! a short defer so callback-reconnecting clients don't race the listener)
//! warm one system-scoped connection per actively mapped server. Shutdown
//! drains sessions, buckets, and the cache; cancelling the state's token
//! also stops the rmcp SSE servers.

use std::time::Duration;

use anyhow::{Context, Result};
use mmg_config::GatewayConfig;
use mmg_repo::{NamespaceStore, ServerStore};
use mmg_upstream::SYSTEM_WARM_KEY;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::http;
use crate::state::AppState;

const WARM_START_DELAY: Duration = Duration::from_secs(3);

pub async fn run(config: GatewayConfig) -> Result<()> {
    let state = AppState::build(config).await?;
    run_with_state(state).await
}

pub(crate) async fn run_with_state(state: AppState) -> Result<()> {
    let bind_addr = format!("{}:{}", state.config.http_bind, state.config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway at {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local gateway address")?;

    let shutdown = state.shutdown.clone();
    let pool_reaper = state.deps.pool.spawn_reaper(shutdown.clone());
    let cache_sweeper = state.deps.cache.spawn_sweeper(shutdown.clone());
    let session_reaper = spawn_session_reaper(&state, shutdown.clone());

    {
        let warm_state = state.clone();
        let warm_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = warm_shutdown.cancelled() => {}
                _ = tokio::time::sleep(WARM_START_DELAY) => {
                    warm_idle_connections(&warm_state).await;
                }
            }
        });
    }

    tracing::info!(addr = %local_addr, "metamcp-gateway listening");

    let app = http::router(state.clone());
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = serve_shutdown.cancelled() => {}
            }
        })
        .await
        .context("gateway HTTP server failed")?;

    drain(&state).await;
    shutdown.cancel();

    for task in [pool_reaper, cache_sweeper, session_reaper] {
        if let Err(error) = task.await {
            tracing::debug!(error = %error, "background task join failed");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

fn spawn_session_reaper(
    state: &AppState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let state = state.clone();
    let policy = state.config.sessions;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.cleanup_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = state.sessions.reap_idle(policy.max_idle_time()).await;
                    for entry in &removed {
                        state.services.close_streamable_session(entry).await;
                        tracing::info!(
                            session_id = %entry.session_id,
                            api_key_uuid = %entry.key_uuid,
                            "reaped idle session"
                        );
                    }
                }
            }
        }
    })
}

/// Establishes one idle-warm connection per actively mapped server under the
/// reserved system key, amortizing cold-start latency for first clients.
pub(crate) async fn warm_idle_connections(state: &AppState) {
    let uuids = match state.repo.active_server_uuids().await {
        Ok(uuids) => uuids,
        Err(error) => {
            tracing::warn!(error = %error, "failed to enumerate servers for warm-up");
            return;
        }
    };

    for server_uuid in uuids {
        let def = match state.repo.find_by_id(server_uuid).await {
            Ok(Some(def)) => def,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(server_uuid = %server_uuid, error = %error, "warm-up lookup failed");
                continue;
            }
        };
        match state
            .deps
            .pool
            .get_connection(SYSTEM_WARM_KEY, Uuid::nil(), &def)
            .await
        {
            Ok(_) => tracing::info!(server = %def.name, "warmed upstream connection"),
            Err(error) => {
                tracing::warn!(server = %def.name, error = %error, "warm-up connection failed");
            }
        }
    }
}

async fn drain(state: &AppState) {
    let removed = state.sessions.drain_all().await;
    for entry in &removed {
        state.services.close_streamable_session(entry).await;
    }
    tracing::info!(count = removed.len(), "closed sessions on shutdown");

    state.deps.pool.cleanup_all().await;
    state.deps.cache.sweep_expired();
}
