//! MCP client for a single upstream server.
//!
//! Wraps an rmcp client service over one of the three transports. Requests
//! on one upstream are serialized (MCP is ordered per connection); distinct
//! upstreams proceed in parallel.

use std::process::ExitStatus;
use std::time::Instant;

use anyhow::{Context, Result};
use mmg_config::UpstreamConfig;
use mmg_core::GatewayError;
use mmg_repo::{McpServerDefinition, ServerLaunch};
use rmcp::RoleClient;
use rmcp::model::{CallToolRequestParam, CallToolResult, ServerCapabilities, Tool};
use rmcp::service::{RunningService, ServiceExt};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::stdio_filter::{FilteredStdioProcess, ProcessController, spawn_filtered};

/// Exit details delivered to the crash callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrashInfo {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl CrashInfo {
    pub(crate) fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            exit_code: status.code(),
            signal,
        }
    }
}

pub(crate) type CrashCallback = Box<dyn Fn(CrashInfo) + Send + Sync>;

struct ClientInner {
    service: RunningService<RoleClient, ()>,
    process: Option<ProcessController>,
}

/// A live connection to one upstream MCP server.
pub struct UpstreamClient {
    server_uuid: Uuid,
    server_name: String,
    transport_label: &'static str,
    config: UpstreamConfig,
    inner: Mutex<Option<ClientInner>>,
}

impl UpstreamClient {
    /// Connects to the upstream described by `def` and registers the crash
    /// callback (stdio upstreams only; networked transports surface failures
    /// on the next request instead).
    pub(crate) async fn connect(
        def: &McpServerDefinition,
        config: UpstreamConfig,
        on_crash: Option<CrashCallback>,
    ) -> Result<Self> {
        let inner = match &def.launch {
            ServerLaunch::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
                let FilteredStdioProcess {
                    frames,
                    stdin,
                    controller,
                } = spawn_filtered(
                    &def.name,
                    command,
                    args,
                    env,
                    cwd.as_deref(),
                    config.shutdown_grace(),
                    crash_tx,
                )
                .await?;

                if let Some(callback) = on_crash {
                    tokio::spawn(async move {
                        if let Some(info) = crash_rx.recv().await {
                            callback(info);
                        }
                    });
                }

                let service = match ().serve((frames, stdin)).await {
                    Ok(service) => service,
                    Err(error) => {
                        controller.shutdown().await;
                        return Err(error)
                            .with_context(|| format!("MCP handshake failed for '{}'", def.name));
                    }
                };

                ClientInner {
                    service,
                    process: Some(controller),
                }
            }
            ServerLaunch::Sse { url, bearer_token } => {
                use rmcp::transport::SseClientTransport;
                use rmcp::transport::sse_client::SseClientConfig;

                let client = http_client(bearer_token.as_deref())?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: url.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("failed to open SSE transport for '{}'", def.name))?;

                let service = ().serve(transport).await.with_context(|| {
                    format!("failed to connect to SSE MCP server '{}' at {url}", def.name)
                })?;

                ClientInner {
                    service,
                    process: None,
                }
            }
            ServerLaunch::StreamableHttp { url, bearer_token } => {
                use rmcp::transport::StreamableHttpClientTransport;
                use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

                let mut transport_config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                if let Some(token) = bearer_token {
                    transport_config = transport_config.auth_header(token.clone());
                }
                let transport = StreamableHttpClientTransport::from_config(transport_config);

                let service = ().serve(transport).await.with_context(|| {
                    format!(
                        "failed to connect to streamable HTTP MCP server '{}' at {url}",
                        def.name
                    )
                })?;

                ClientInner {
                    service,
                    process: None,
                }
            }
        };

        Ok(Self {
            server_uuid: def.server_uuid,
            server_name: def.name.clone(),
            transport_label: def.launch.label(),
            config,
            inner: Mutex::new(Some(inner)),
        })
    }

    pub fn server_uuid(&self) -> Uuid {
        self.server_uuid
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn transport_label(&self) -> &'static str {
        self.transport_label
    }

    /// Capabilities advertised by the upstream during the handshake.
    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        let inner = self.inner.lock().await;
        inner
            .as_ref()
            .and_then(|inner| inner.service.peer_info().map(|info| info.capabilities.clone()))
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, GatewayError> {
        let started = Instant::now();
        let inner = self.inner.lock().await;
        let Some(inner) = inner.as_ref() else {
            return Err(self.closed_error());
        };

        match tokio::time::timeout(self.config.effective_deadline(), inner.service.list_tools(None))
            .await
        {
            Ok(Ok(response)) => Ok(response.tools),
            Ok(Err(error)) => Err(GatewayError::Upstream {
                server: self.server_name.clone(),
                message: error.to_string(),
            }),
            Err(_) => Err(GatewayError::UpstreamTimeout {
                server: self.server_name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    pub async fn call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, GatewayError> {
        let started = Instant::now();
        let inner = self.inner.lock().await;
        let Some(inner) = inner.as_ref() else {
            return Err(self.closed_error());
        };

        match tokio::time::timeout(
            self.config.effective_deadline(),
            inner.service.call_tool(request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(GatewayError::Upstream {
                server: self.server_name.clone(),
                message: error.to_string(),
            }),
            Err(_) => Err(GatewayError::UpstreamTimeout {
                server: self.server_name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Cancels the MCP service and, for stdio upstreams, stops the child
    /// process. Idempotent.
    pub async fn shutdown(&self) {
        let Some(inner) = self.inner.lock().await.take() else {
            return;
        };

        if let Some(process) = &inner.process {
            process.begin_shutdown();
        }
        if let Err(error) = inner.service.cancel().await {
            tracing::debug!(
                server = %self.server_name,
                error = %error,
                "failed to cancel MCP client service"
            );
        }
        if let Some(process) = inner.process {
            process.shutdown().await;
        }
    }

    fn closed_error(&self) -> GatewayError {
        GatewayError::UpstreamUnavailable {
            server: self.server_name.clone(),
            reason: "connection closed".to_string(),
        }
    }
}

fn http_client(bearer_token: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(token) = bearer_token {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = format!("Bearer {token}")
            .parse()
            .context("bearer token contains invalid header characters")?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
        builder = builder.default_headers(headers);
    }
    builder.build().context("failed to build HTTP client")
}
