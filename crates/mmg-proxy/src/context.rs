use std::sync::Arc;

use mmg_cache::ToolResponseCache;
use mmg_repo::Repository;
use mmg_upstream::{ErrorTracker, UpstreamPool};
use uuid::Uuid;

/// Immutable identity of one client session. Threaded explicitly through
/// every handler; never stored in ambient state.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub namespace_uuid: Uuid,
    pub api_key: String,
    pub key_uuid: Uuid,
    pub user_id: Option<Uuid>,
    pub include_inactive_servers: bool,
}

/// Shared collaborators injected into handlers and middleware.
#[derive(Clone)]
pub struct ProxyDeps {
    pub repo: Arc<dyn Repository>,
    pub pool: Arc<UpstreamPool>,
    pub tracker: Arc<ErrorTracker>,
    pub cache: Arc<ToolResponseCache>,
}
