//! Base aggregation handlers: `tools/list` fan-out with name prefixing and
//! `tools/call` dispatch by prefix resolution.

use async_trait::async_trait;
use mmg_core::{GatewayError, prefixed_tool_name, sanitize_server_name, split_prefixed_name};
use mmg_repo::{ErrorStatus, NamespaceStore, ServerMapping};
use rmcp::ErrorData as McpError;
use rmcp::model::{CallToolRequestParam, CallToolResult, Content, ListToolsResult, Tool};
use tokio::task::JoinSet;

use crate::context::{ProxyDeps, SessionContext};
use crate::middleware::{CallToolHandler, ListToolsHandler};

/// Renders a tool-level failure as an MCP error result so transport-level
/// errors never leak into the MCP channel.
pub fn tool_error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

/// Fans `tools/list` out to every mapped upstream and prefixes tool names
/// with the sanitized server name.
pub struct AggregateListTools {
    deps: ProxyDeps,
}

impl AggregateListTools {
    pub fn new(deps: ProxyDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl ListToolsHandler for AggregateListTools {
    async fn handle(&self, cx: &SessionContext) -> Result<ListToolsResult, McpError> {
        let mappings = self
            .deps
            .repo
            .server_mappings(cx.namespace_uuid, cx.include_inactive_servers)
            .await
            .map_err(|error| {
                McpError::internal_error(format!("failed to load namespace servers: {error}"), None)
            })?;

        let mut join_set: JoinSet<(usize, Option<(String, Vec<Tool>)>)> = JoinSet::new();
        for (index, mapping) in mappings.into_iter().enumerate() {
            let pool = self.deps.pool.clone();
            let api_key = cx.api_key.clone();
            let key_uuid = cx.key_uuid;
            let namespace = cx.namespace_uuid;
            join_set.spawn(async move {
                let server = mapping.server;
                let client = match pool.get_connection(&api_key, key_uuid, &server).await {
                    Ok(client) => client,
                    Err(error) => {
                        tracing::warn!(
                            server = %server.name,
                            namespace = %namespace,
                            error = %error,
                            "skipping upstream in tools/list"
                        );
                        return (index, None);
                    }
                };

                // Some upstreams under-advertise; issue tools/list even when
                // the capability is missing.
                if let Some(caps) = client.server_capabilities().await {
                    if caps.tools.is_none() {
                        tracing::debug!(
                            server = %server.name,
                            "upstream does not advertise tools; listing anyway"
                        );
                    }
                }

                match client.list_tools().await {
                    Ok(tools) => (index, Some((server.name.clone(), tools))),
                    Err(error) => {
                        tracing::warn!(
                            server = %server.name,
                            namespace = %namespace,
                            error = %error,
                            "tools/list failed for upstream"
                        );
                        (index, None)
                    }
                }
            });
        }

        let mut per_server: Vec<(usize, String, Vec<Tool>)> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Some((server_name, tools)))) => {
                    per_server.push((index, server_name, tools));
                }
                Ok((_, None)) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "tools/list fan-out task panicked");
                }
            }
        }
        per_server.sort_by_key(|(index, _, _)| *index);

        let mut tools = Vec::new();
        for (_, server_name, server_tools) in per_server {
            for mut tool in server_tools {
                tool.name = prefixed_tool_name(&server_name, &tool.name).into();
                tools.push(tool);
            }
        }

        Ok(ListToolsResult::with_all_items(tools))
    }
}

/// Routes `tools/call` to the upstream resolved from the name prefix.
pub struct DispatchCallTool {
    deps: ProxyDeps,
}

impl DispatchCallTool {
    pub fn new(deps: ProxyDeps) -> Self {
        Self { deps }
    }
}

/// First mapping whose sanitized server name equals `prefix`; mapping order
/// breaks ties.
pub(crate) fn resolve_prefix<'a>(
    mappings: &'a [ServerMapping],
    prefix: &str,
) -> Option<&'a ServerMapping> {
    mappings
        .iter()
        .find(|mapping| sanitize_server_name(&mapping.server.name) == prefix)
}

#[async_trait]
impl CallToolHandler for DispatchCallTool {
    async fn handle(
        &self,
        request: CallToolRequestParam,
        cx: &SessionContext,
    ) -> Result<CallToolResult, McpError> {
        let full_name = request.name.to_string();
        let Some((prefix, original)) = split_prefixed_name(&full_name) else {
            return Ok(tool_error_result(
                GatewayError::InvalidToolName(full_name.clone()).to_string(),
            ));
        };

        let mappings = self
            .deps
            .repo
            .server_mappings(cx.namespace_uuid, cx.include_inactive_servers)
            .await
            .map_err(|error| {
                McpError::internal_error(format!("failed to load namespace servers: {error}"), None)
            })?;

        let Some(mapping) = resolve_prefix(&mappings, prefix) else {
            return Ok(tool_error_result(
                GatewayError::UnknownTool(prefix.to_string()).to_string(),
            ));
        };
        let server = &mapping.server;

        let in_error = match self.deps.tracker.is_server_in_error_state(server.server_uuid).await {
            Ok(flag) => flag,
            Err(error) => {
                tracing::warn!(
                    server = %server.name,
                    error = %error,
                    "error-state lookup failed; falling back to mapping snapshot"
                );
                server.error_status == ErrorStatus::Error
            }
        };
        if in_error {
            return Ok(tool_error_result(format!(
                "server '{}' in error state; reset required",
                server.name
            )));
        }

        let client = match self
            .deps
            .pool
            .get_connection(&cx.api_key, cx.key_uuid, server)
            .await
        {
            Ok(client) => client,
            Err(error) => return Ok(tool_error_result(error.to_string())),
        };

        let upstream_request = CallToolRequestParam {
            name: original.to_string().into(),
            arguments: request.arguments,
        };
        match client.call_tool(upstream_request).await {
            Ok(result) => Ok(result),
            Err(error) => {
                tracing::warn!(
                    server = %server.name,
                    tool = original,
                    namespace = %cx.namespace_uuid,
                    error = %error,
                    "tools/call failed"
                );
                Ok(tool_error_result(error.to_string()))
            }
        }
    }
}
