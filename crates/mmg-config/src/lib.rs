//! Gateway configuration: compile-time defaults overridden by environment
//! variables. Values are read once at startup; components receive plain
//! structs rather than reading the environment themselves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 12008;
const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_POOL_MAX_IDLE_SECS: u64 = 2 * 60 * 60;
const DEFAULT_POOL_CLEANUP_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_MAX_CONNECTIONS_PER_API_KEY: usize = 50;
const DEFAULT_MAX_GLOBAL_CONNECTIONS: usize = 100;

const DEFAULT_SESSION_MAX_IDLE_SECS: u64 = 2 * 60 * 60;
const DEFAULT_SESSION_CLEANUP_INTERVAL_SECS: u64 = 30 * 60;

const DEFAULT_CACHE_MAX_ENTRIES: usize = 1000;
const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 60;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_MAX_TOTAL_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_STDIO_COOLDOWN_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfig {
    pub http_bind: String,
    pub http_port: u16,
    pub max_request_body_bytes: usize,
    /// Seed file for the in-memory repository (servers, namespaces, keys).
    pub seed_path: Option<PathBuf>,
    pub pool: PoolConfig,
    pub sessions: SessionPolicy,
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
}

/// Per-API-key connection pool policies.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolConfig {
    pub max_idle_time_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_connections_per_api_key: usize,
    pub max_global_connections: usize,
}

/// Client-session idle policy for the transport router.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionPolicy {
    pub max_idle_time_secs: u64,
    pub cleanup_interval_secs: u64,
}

/// Tool response cache sizing and the optional distributed tier.
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub max_memory_entries: usize,
    pub default_ttl_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Base URL of the REST key-value backend; absent means L1-only.
    pub l2_endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub l2_token: Option<String>,
}

/// Upstream request timeouts and spawn policies.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UpstreamConfig {
    pub request_timeout_ms: u64,
    pub max_total_timeout_ms: u64,
    pub reset_timeout_on_progress: bool,
    pub stdio_cooldown_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_time_secs: DEFAULT_POOL_MAX_IDLE_SECS,
            cleanup_interval_secs: DEFAULT_POOL_CLEANUP_INTERVAL_SECS,
            max_connections_per_api_key: DEFAULT_MAX_CONNECTIONS_PER_API_KEY,
            max_global_connections: DEFAULT_MAX_GLOBAL_CONNECTIONS,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_idle_time_secs: DEFAULT_SESSION_MAX_IDLE_SECS,
            cleanup_interval_secs: DEFAULT_SESSION_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_entries: DEFAULT_CACHE_MAX_ENTRIES,
            default_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cleanup_interval_secs: DEFAULT_CACHE_CLEANUP_INTERVAL_SECS,
            l2_endpoint: None,
            l2_token: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_total_timeout_ms: DEFAULT_MAX_TOTAL_TIMEOUT_MS,
            reset_timeout_on_progress: false,
            stdio_cooldown_secs: DEFAULT_STDIO_COOLDOWN_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
            seed_path: None,
            pool: PoolConfig::default(),
            sessions: SessionPolicy::default(),
            cache: CacheConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads defaults and applies any environment overrides.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_env_map(&vars)
    }

    /// Pure form of [`GatewayConfig::from_env`] for tests.
    pub fn from_env_map(vars: &HashMap<String, String>) -> Self {
        let mut cfg = Self::default();

        if let Some(bind) = vars.get("METAMCP_HTTP_BIND") {
            cfg.http_bind = bind.clone();
        }
        set_parsed(vars, "METAMCP_HTTP_PORT", &mut cfg.http_port);
        set_parsed(
            vars,
            "METAMCP_MAX_REQUEST_BODY_BYTES",
            &mut cfg.max_request_body_bytes,
        );
        if let Some(path) = vars.get("METAMCP_SEED_PATH") {
            cfg.seed_path = Some(PathBuf::from(path));
        }

        set_parsed(vars, "POOL_MAX_IDLE_TIME", &mut cfg.pool.max_idle_time_secs);
        set_parsed(
            vars,
            "POOL_CLEANUP_INTERVAL",
            &mut cfg.pool.cleanup_interval_secs,
        );
        set_parsed(
            vars,
            "POOL_MAX_CONNECTIONS_PER_API_KEY",
            &mut cfg.pool.max_connections_per_api_key,
        );
        set_parsed(
            vars,
            "POOL_MAX_GLOBAL_CONNECTIONS",
            &mut cfg.pool.max_global_connections,
        );

        set_parsed(
            vars,
            "SESSION_MAX_IDLE_TIME",
            &mut cfg.sessions.max_idle_time_secs,
        );
        set_parsed(
            vars,
            "SESSION_CLEANUP_INTERVAL",
            &mut cfg.sessions.cleanup_interval_secs,
        );

        set_parsed(
            vars,
            "TOOL_CACHE_MAX_ENTRIES",
            &mut cfg.cache.max_memory_entries,
        );
        set_parsed(vars, "TOOL_CACHE_DEFAULT_TTL", &mut cfg.cache.default_ttl_secs);
        set_parsed(
            vars,
            "TOOL_CACHE_CLEANUP_INTERVAL",
            &mut cfg.cache.cleanup_interval_secs,
        );
        if let Some(url) = vars.get("TOOL_CACHE_L2_URL") {
            cfg.cache.l2_endpoint = Some(url.clone());
        }
        if let Some(token) = vars.get("TOOL_CACHE_L2_TOKEN") {
            cfg.cache.l2_token = Some(token.clone());
        }

        set_parsed(
            vars,
            "MCP_REQUEST_TIMEOUT_MS",
            &mut cfg.upstream.request_timeout_ms,
        );
        set_parsed(
            vars,
            "MCP_MAX_TOTAL_TIMEOUT_MS",
            &mut cfg.upstream.max_total_timeout_ms,
        );
        if let Some(flag) = vars.get("MCP_RESET_TIMEOUT_ON_PROGRESS") {
            cfg.upstream.reset_timeout_on_progress =
                matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
        set_parsed(
            vars,
            "STDIO_COOLDOWN_DURATION",
            &mut cfg.upstream.stdio_cooldown_secs,
        );
        set_parsed(
            vars,
            "STDIO_SHUTDOWN_GRACE",
            &mut cfg.upstream.shutdown_grace_secs,
        );

        cfg
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl SessionPolicy {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_secs(self.max_idle_time_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn max_total_timeout(&self) -> Duration {
        Duration::from_millis(self.max_total_timeout_ms)
    }

    pub fn stdio_cooldown(&self) -> Duration {
        Duration::from_secs(self.stdio_cooldown_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Deadline applied to a single upstream request.
    ///
    /// With progress-based resets enabled the per-request deadline extends to
    /// the total cap; otherwise the tighter of the two applies.
    pub fn effective_deadline(&self) -> Duration {
        if self.reset_timeout_on_progress {
            self.max_total_timeout()
        } else {
            self.request_timeout().min(self.max_total_timeout())
        }
    }
}

fn set_parsed<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = vars.get(key) {
        if let Ok(value) = raw.trim().parse::<T>() {
            *target = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policies() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.pool.max_idle_time_secs, 7200);
        assert_eq!(cfg.pool.cleanup_interval_secs, 1800);
        assert_eq!(cfg.pool.max_connections_per_api_key, 50);
        assert_eq!(cfg.pool.max_global_connections, 100);
        assert_eq!(cfg.cache.max_memory_entries, 1000);
        assert_eq!(cfg.cache.default_ttl_secs, 300);
        assert_eq!(cfg.upstream.stdio_cooldown_secs, 10);
        assert_eq!(cfg.upstream.shutdown_grace_secs, 5);
    }

    #[test]
    fn env_overrides_apply() {
        let mut vars = HashMap::new();
        vars.insert("TOOL_CACHE_MAX_ENTRIES".to_string(), "25".to_string());
        vars.insert("TOOL_CACHE_DEFAULT_TTL".to_string(), "9".to_string());
        vars.insert("STDIO_COOLDOWN_DURATION".to_string(), "3".to_string());
        vars.insert("METAMCP_HTTP_PORT".to_string(), "18080".to_string());
        vars.insert(
            "MCP_RESET_TIMEOUT_ON_PROGRESS".to_string(),
            "true".to_string(),
        );

        let cfg = GatewayConfig::from_env_map(&vars);
        assert_eq!(cfg.cache.max_memory_entries, 25);
        assert_eq!(cfg.cache.default_ttl_secs, 9);
        assert_eq!(cfg.upstream.stdio_cooldown_secs, 3);
        assert_eq!(cfg.http_port, 18080);
        assert!(cfg.upstream.reset_timeout_on_progress);
    }

    #[test]
    fn unparsable_override_keeps_default() {
        let mut vars = HashMap::new();
        vars.insert("METAMCP_HTTP_PORT".to_string(), "not-a-port".to_string());
        let cfg = GatewayConfig::from_env_map(&vars);
        assert_eq!(cfg.http_port, 12008);
    }

    #[test]
    fn effective_deadline_honors_progress_flag() {
        let mut up = UpstreamConfig::default();
        up.request_timeout_ms = 1_000;
        up.max_total_timeout_ms = 60_000;
        assert_eq!(up.effective_deadline(), Duration::from_secs(1));
        up.reset_timeout_on_progress = true;
        assert_eq!(up.effective_deadline(), Duration::from_secs(60));
    }
}
