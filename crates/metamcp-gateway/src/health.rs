//! Health and metrics endpoints: JSON snapshots of cache, pool, and session
//! state.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use mmg_cache::CacheHealth;
use serde_json::json;

use crate::state::AppState;

/// Repository pool sizing honored as a consumer; the store itself is
/// external.
const DB_POOL_MIN: u32 = 2;
const DB_POOL_MAX: u32 = 20;

pub(crate) async fn health_handler(State(state): State<AppState>) -> Response {
    let cache = state.deps.cache.status();
    let pool = state.deps.pool.status().await;
    let sessions = state.sessions.count().await;

    let degraded = cache.health == CacheHealth::Error
        || pool.connections >= pool.max_global_connections;
    let status = if degraded { "degraded" } else { "ok" };
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = json!({
        "status": status,
        "uptime": state.started_at.elapsed().as_secs(),
        "cache": {
            "hitRate": cache.hit_rate,
            "entries": cache.entries,
            "memoryMB": cache.memory_mb,
            "l2Connected": cache.l2_connected,
        },
        "pools": {
            "db": { "min": DB_POOL_MIN, "max": DB_POOL_MAX },
            "upstreams": pool.connections,
            "sessions": sessions,
        },
        "memoryMB": process_rss_mb().unwrap_or(0.0),
    });
    (code, Json(body)).into_response()
}

pub(crate) async fn metrics_handler(State(state): State<AppState>) -> Response {
    let cache = state.deps.cache.status();
    let pool = state.deps.pool.status().await;
    let sessions = state.sessions.count().await;

    let body = json!({
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "cache": cache,
        "pool": pool,
        "sessions": { "active": sessions },
        "process": { "rssMB": process_rss_mb().unwrap_or(0.0) },
    });
    Json(body).into_response()
}

/// Resident set size in MiB, read from procfs where available.
fn process_rss_mb() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
        let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
        Some(kb / 1024.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
