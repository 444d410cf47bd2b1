use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use mmg_cache::ToolResponseCache;
use mmg_config::GatewayConfig;
use mmg_proxy::ProxyDeps;
use mmg_repo::MemoryRepository;
use mmg_upstream::{ErrorTracker, UpstreamPool};
use tokio_util::sync::CancellationToken;

use crate::services::McpServices;
use crate::sessions::SessionIndex;

/// Everything the HTTP handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub repo: Arc<MemoryRepository>,
    pub deps: ProxyDeps,
    pub services: Arc<McpServices>,
    pub sessions: Arc<SessionIndex>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let repo = match &config.seed_path {
            Some(path) => Arc::new(
                MemoryRepository::from_seed_path(path)
                    .await
                    .with_context(|| format!("failed to load seed: {}", path.display()))?,
            ),
            None => Arc::new(MemoryRepository::new()),
        };
        Ok(Self::with_repository(config, repo))
    }

    /// Test seam: assemble fresh state around an existing repository, never
    /// touching process-global state.
    pub fn with_repository(config: GatewayConfig, repo: Arc<MemoryRepository>) -> Self {
        let tracker = Arc::new(ErrorTracker::new(
            repo.clone(),
            config.upstream.stdio_cooldown(),
        ));
        let pool = UpstreamPool::new(config.pool, config.upstream, tracker.clone());
        let cache = Arc::new(ToolResponseCache::new(&config.cache));

        let deps = ProxyDeps {
            repo: repo.clone(),
            pool,
            tracker,
            cache,
        };

        let advertise_addr = format!("{}:{}", config.http_bind, config.http_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
        let shutdown = CancellationToken::new();
        let services = Arc::new(McpServices::new(
            deps.clone(),
            advertise_addr,
            shutdown.child_token(),
        ));

        Self {
            config: Arc::new(config),
            repo,
            deps,
            services,
            sessions: Arc::new(SessionIndex::new()),
            shutdown,
            started_at: Instant::now(),
        }
    }
}
