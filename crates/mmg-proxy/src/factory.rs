//! Per-session MetaMCP server assembly.
//!
//! Each client session gets a fresh server instance whose `tools/list` and
//! `tools/call` handlers are the middleware-composed chains: tool filtering
//! outermost, then response caching, then the base aggregation handlers.
//! The instance implements [`rmcp::ServerHandler`]; JSON-RPC framing,
//! lifecycle methods, and protocol negotiation stay inside rmcp's service
//! layer.

use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};

use crate::context::{ProxyDeps, SessionContext};
use crate::handlers::{AggregateListTools, DispatchCallTool};
use crate::middleware::{
    CacheToolCalls, FilterToolsCall, FilterToolsList, SharedCallHandler, SharedListHandler,
    compose_call, compose_list,
};

const SERVER_NAME: &str = "metamcp-gateway";

/// One session's MCP server: composed handlers plus the immutable session
/// identity. Cloning shares the underlying handler chain.
#[derive(Clone)]
pub struct MetaMcpServer {
    cx: SessionContext,
    list_chain: SharedListHandler,
    call_chain: SharedCallHandler,
}

impl MetaMcpServer {
    pub fn new(cx: SessionContext, deps: &ProxyDeps) -> Self {
        let list_chain = compose_list(
            vec![Box::new(FilterToolsList::new(deps.repo.clone()))],
            std::sync::Arc::new(AggregateListTools::new(deps.clone())),
        );
        let call_chain = compose_call(
            vec![
                Box::new(FilterToolsCall::new(deps.repo.clone())),
                Box::new(CacheToolCalls::new(deps.repo.clone(), deps.cache.clone())),
            ],
            std::sync::Arc::new(DispatchCallTool::new(deps.clone())),
        );

        Self {
            cx,
            list_chain,
            call_chain,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.cx
    }

    pub(crate) async fn list_tools_internal(&self) -> Result<ListToolsResult, McpError> {
        self.list_chain.handle(&self.cx).await
    }

    pub(crate) async fn call_tool_internal(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, McpError> {
        self.call_chain.handle(request, &self.cx).await
    }

    /// Releases per-session scratch state when the owning transport session
    /// closes. The API-key bucket is shared with other sessions and stays
    /// alive.
    pub fn cleanup(&self) {
        tracing::debug!(
            namespace = %self.cx.namespace_uuid,
            api_key_uuid = %self.cx.key_uuid,
            "session server cleaned up"
        );
    }
}

impl ServerHandler for MetaMcpServer {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        self.list_tools_internal().await
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_internal(request).await
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = SERVER_NAME.to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

#[cfg(test)]
#[path = "factory_tests.rs"]
mod factory_tests;
