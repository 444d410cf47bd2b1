//! Handler traits and the middleware pipeline.
//!
//! A middleware wraps a handler and returns a handler; `compose` applies a
//! list so the first middleware's pre-phase runs first and its post-phase
//! last. Built-ins: namespace tool filtering and response caching.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use mmg_cache::{ToolResponseCache, cache_key};
use mmg_core::{sanitize_server_name, split_prefixed_name};
use mmg_repo::{NamespaceStore, Repository, ToolStore};
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolRequestParam, CallToolResult, ListToolsResult};
use serde_json::Value;
use uuid::Uuid;

use crate::context::SessionContext;
use crate::handlers::tool_error_result;

#[async_trait]
pub trait ListToolsHandler: Send + Sync {
    async fn handle(&self, cx: &SessionContext) -> Result<ListToolsResult, McpError>;
}

#[async_trait]
pub trait CallToolHandler: Send + Sync {
    async fn handle(
        &self,
        request: CallToolRequestParam,
        cx: &SessionContext,
    ) -> Result<CallToolResult, McpError>;
}

pub type SharedListHandler = Arc<dyn ListToolsHandler>;
pub type SharedCallHandler = Arc<dyn CallToolHandler>;

/// Applies middlewares so the first element becomes the outermost wrapper.
pub fn compose_list(
    middlewares: Vec<Box<dyn FnOnce(SharedListHandler) -> SharedListHandler>>,
    base: SharedListHandler,
) -> SharedListHandler {
    middlewares
        .into_iter()
        .rev()
        .fold(base, |inner, middleware| middleware(inner))
}

/// Call-side counterpart of [`compose_list`].
pub fn compose_call(
    middlewares: Vec<Box<dyn FnOnce(SharedCallHandler) -> SharedCallHandler>>,
    base: SharedCallHandler,
) -> SharedCallHandler {
    middlewares
        .into_iter()
        .rev()
        .fold(base, |inner, middleware| middleware(inner))
}

/// Maps sanitized server prefixes to server UUIDs for the namespace.
async fn prefix_index(
    repo: &Arc<dyn Repository>,
    cx: &SessionContext,
) -> Result<HashMap<String, Uuid>, McpError> {
    let mappings = repo
        .server_mappings(cx.namespace_uuid, cx.include_inactive_servers)
        .await
        .map_err(|error| {
            McpError::internal_error(format!("failed to load namespace servers: {error}"), None)
        })?;

    let mut index = HashMap::new();
    for mapping in mappings {
        index
            .entry(sanitize_server_name(&mapping.server.name))
            .or_insert(mapping.server.server_uuid);
    }
    Ok(index)
}

/// Set of `(server_uuid, tool_name)` pairs disabled in the namespace.
async fn disabled_tools(
    repo: &Arc<dyn Repository>,
    namespace_uuid: Uuid,
) -> Result<HashSet<(Uuid, String)>, McpError> {
    let mappings = repo.tool_mappings(namespace_uuid).await.map_err(|error| {
        McpError::internal_error(format!("failed to load tool mappings: {error}"), None)
    })?;

    Ok(mappings
        .into_iter()
        .filter(|mapping| !mapping.status.is_active())
        .map(|mapping| (mapping.server_uuid, mapping.name))
        .collect())
}

/// Drops tools disabled by `NamespaceToolMapping` from list responses.
pub struct FilterToolsList {
    inner: SharedListHandler,
    repo: Arc<dyn Repository>,
}

impl FilterToolsList {
    pub fn new(repo: Arc<dyn Repository>) -> impl FnOnce(SharedListHandler) -> SharedListHandler {
        move |inner| Arc::new(Self { inner, repo }) as SharedListHandler
    }
}

#[async_trait]
impl ListToolsHandler for FilterToolsList {
    async fn handle(&self, cx: &SessionContext) -> Result<ListToolsResult, McpError> {
        let mut result = self.inner.handle(cx).await?;

        let disabled = disabled_tools(&self.repo, cx.namespace_uuid).await?;
        if disabled.is_empty() {
            return Ok(result);
        }
        let prefixes = prefix_index(&self.repo, cx).await?;

        result.tools.retain(|tool| {
            let Some((prefix, original)) = split_prefixed_name(&tool.name) else {
                return true;
            };
            let Some(server_uuid) = prefixes.get(prefix) else {
                return true;
            };
            !disabled.contains(&(*server_uuid, original.to_string()))
        });
        Ok(result)
    }
}

/// Rejects calls against disabled tools with an MCP error result.
pub struct FilterToolsCall {
    inner: SharedCallHandler,
    repo: Arc<dyn Repository>,
}

impl FilterToolsCall {
    pub fn new(repo: Arc<dyn Repository>) -> impl FnOnce(SharedCallHandler) -> SharedCallHandler {
        move |inner| Arc::new(Self { inner, repo }) as SharedCallHandler
    }
}

#[async_trait]
impl CallToolHandler for FilterToolsCall {
    async fn handle(
        &self,
        request: CallToolRequestParam,
        cx: &SessionContext,
    ) -> Result<CallToolResult, McpError> {
        if let Some((prefix, original)) = split_prefixed_name(request.name.as_ref()) {
            let prefixes = prefix_index(&self.repo, cx).await?;
            if let Some(server_uuid) = prefixes.get(prefix) {
                let disabled = disabled_tools(&self.repo, cx.namespace_uuid).await?;
                if disabled.contains(&(*server_uuid, original.to_string())) {
                    return Ok(tool_error_result(format!(
                        "tool '{original}' is disabled in this namespace"
                    )));
                }
            }
        }
        self.inner.handle(request, cx).await
    }
}

/// Short-circuits cacheable `tools/call` requests on a cache hit and stores
/// successful responses.
pub struct CacheToolCalls {
    inner: SharedCallHandler,
    repo: Arc<dyn Repository>,
    cache: Arc<ToolResponseCache>,
}

impl CacheToolCalls {
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<ToolResponseCache>,
    ) -> impl FnOnce(SharedCallHandler) -> SharedCallHandler {
        move |inner| Arc::new(Self { inner, repo, cache }) as SharedCallHandler
    }
}

#[async_trait]
impl CallToolHandler for CacheToolCalls {
    async fn handle(
        &self,
        request: CallToolRequestParam,
        cx: &SessionContext,
    ) -> Result<CallToolResult, McpError> {
        let Some((prefix, original)) = split_prefixed_name(request.name.as_ref()) else {
            return self.inner.handle(request, cx).await;
        };
        let prefixes = prefix_index(&self.repo, cx).await?;
        let Some(server_uuid) = prefixes.get(prefix).copied() else {
            return self.inner.handle(request, cx).await;
        };

        let args = Value::Object(request.arguments.clone().unwrap_or_default());
        let key = cache_key(server_uuid, original, Some(cx.namespace_uuid), &args);

        if let Some(payload) = self.cache.get(&key, original).await {
            match serde_json::from_value::<CallToolResult>(payload) {
                Ok(result) => {
                    tracing::debug!(tool = original, namespace = %cx.namespace_uuid, "cache hit");
                    return Ok(result);
                }
                Err(error) => {
                    tracing::warn!(tool = original, error = %error, "dropping undecodable cache entry");
                    self.cache.invalidate_pattern(&key);
                }
            }
        }

        let original = original.to_string();
        let result = self.inner.handle(request, cx).await?;
        if result.is_error != Some(true) {
            match serde_json::to_value(&result) {
                Ok(payload) => self.cache.set(&key, &original, payload).await,
                Err(error) => {
                    tracing::warn!(tool = %original, error = %error, "failed to serialize response for cache");
                }
            }
        }
        Ok(result)
    }
}
