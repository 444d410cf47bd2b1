//! Lazily constructed rmcp server transports.
//!
//! The gateway does not speak JSON-RPC itself: each `(namespace, API key)`
//! pair gets its own rmcp transport whose per-session handler factory mints
//! a fresh [`MetaMcpServer`]. Streamable HTTP uses
//! `StreamableHttpService` with a local session manager; the legacy SSE pair
//! uses `SseServer` with the endpoint paths of that namespace. Keying the
//! transports by API key is what isolates sessions between keys.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::IntoResponse;
use mmg_proxy::{MetaMcpServer, ProxyDeps, SessionContext};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::http::MCP_SESSION_ID_HEADER;
use crate::sessions::OwnedSession;

const STREAM_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub type McpService = StreamableHttpService<MetaMcpServer, LocalSessionManager>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    namespace: Uuid,
    api_key: String,
    include_inactive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SseKey {
    namespace: Uuid,
    api_key: String,
}

struct SseEntry {
    router: Router,
    shutdown: CancellationToken,
}

pub struct McpServices {
    deps: ProxyDeps,
    /// Advertised bind address, informational for the SSE transport config.
    advertise_addr: SocketAddr,
    shutdown: CancellationToken,
    streamable: RwLock<HashMap<StreamKey, McpService>>,
    sse: RwLock<HashMap<SseKey, SseEntry>>,
}

impl McpServices {
    pub fn new(deps: ProxyDeps, advertise_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            advertise_addr,
            shutdown,
            streamable: RwLock::new(HashMap::new()),
            sse: RwLock::new(HashMap::new()),
        }
    }

    fn handler_for(
        &self,
        namespace_uuid: Uuid,
        api_key: &str,
        key_uuid: Uuid,
        user_id: Option<Uuid>,
        include_inactive: bool,
    ) -> MetaMcpServer {
        MetaMcpServer::new(
            SessionContext {
                namespace_uuid,
                api_key: api_key.to_string(),
                key_uuid,
                user_id,
                include_inactive_servers: include_inactive,
            },
            &self.deps,
        )
    }

    /// Streamable-HTTP transport for `(namespace, api_key)`, created on
    /// first use. rmcp owns session creation and the `mcp-session-id`
    /// exchange.
    pub async fn streamable(
        &self,
        namespace_uuid: Uuid,
        api_key: &str,
        key_uuid: Uuid,
        user_id: Option<Uuid>,
        include_inactive: bool,
    ) -> McpService {
        let key = StreamKey {
            namespace: namespace_uuid,
            api_key: api_key.to_string(),
            include_inactive,
        };
        if let Some(service) = self.streamable.read().await.get(&key) {
            return service.clone();
        }

        let mut map = self.streamable.write().await;
        if let Some(service) = map.get(&key) {
            return service.clone();
        }

        let handler = self.handler_for(namespace_uuid, api_key, key_uuid, user_id, include_inactive);
        let service = StreamableHttpService::new(
            move || Ok(handler.clone()),
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig {
                sse_keep_alive: Some(STREAM_KEEP_ALIVE),
                stateful_mode: true,
            },
        );
        map.insert(key, service.clone());
        service
    }

    /// Legacy SSE transport router for `(namespace, api_key)`, created on
    /// first `GET /{namespace}/sse`. The returned router serves both the
    /// stream path and the message path of that namespace.
    pub async fn sse_router(
        &self,
        namespace_uuid: Uuid,
        api_key: &str,
        key_uuid: Uuid,
        user_id: Option<Uuid>,
        include_inactive: bool,
    ) -> Router {
        let key = SseKey {
            namespace: namespace_uuid,
            api_key: api_key.to_string(),
        };
        if let Some(entry) = self.sse.read().await.get(&key) {
            return entry.router.clone();
        }

        let mut map = self.sse.write().await;
        if let Some(entry) = map.get(&key) {
            return entry.router.clone();
        }

        let shutdown = self.shutdown.child_token();
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: self.advertise_addr,
            sse_path: format!("/{namespace_uuid}/sse"),
            post_path: format!("/{namespace_uuid}/message"),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });
        let handler = self.handler_for(namespace_uuid, api_key, key_uuid, user_id, include_inactive);
        let _server_ct = sse_server.with_service_directly(move || handler.clone());

        map.insert(
            key,
            SseEntry {
                router: sse_router.clone(),
                shutdown,
            },
        );
        sse_router
    }

    /// SSE router lookup without creation; `None` means no session of that
    /// key can exist on the message path.
    pub async fn existing_sse_router(&self, namespace_uuid: Uuid, api_key: &str) -> Option<Router> {
        let key = SseKey {
            namespace: namespace_uuid,
            api_key: api_key.to_string(),
        };
        self.sse.read().await.get(&key).map(|entry| entry.router.clone())
    }

    /// Closes one streamable session by driving a DELETE through its
    /// transport, keeping rmcp's session state in sync with the ownership
    /// index.
    pub async fn close_streamable_session(&self, session: &OwnedSession) {
        let key = StreamKey {
            namespace: session.namespace_uuid,
            api_key: session.api_key.clone(),
            include_inactive: session.include_inactive,
        };
        let service = self.streamable.read().await.get(&key).cloned();
        let Some(service) = service else { return };

        let request = Request::builder()
            .method(Method::DELETE)
            .uri(format!("/{}/mcp", session.namespace_uuid))
            .header(MCP_SESSION_ID_HEADER, session.session_id.as_str())
            .body(Body::empty());
        match request {
            Ok(request) => {
                let response = service.clone().handle(request).await.into_response();
                tracing::debug!(
                    session_id = %session.session_id,
                    status = %response.status(),
                    "closed streamable session"
                );
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %error,
                    "failed to build session close request"
                );
            }
        }
    }

    /// Drops every transport owned by `api_key`; SSE servers are cancelled,
    /// tearing down their live sessions.
    pub async fn remove_for_key(&self, api_key: &str) {
        self.streamable
            .write()
            .await
            .retain(|key, _| key.api_key != api_key);

        let mut sse = self.sse.write().await;
        let keys: Vec<SseKey> = sse
            .keys()
            .filter(|key| key.api_key == api_key)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = sse.remove(&key) {
                entry.shutdown.cancel();
            }
        }
    }
}
