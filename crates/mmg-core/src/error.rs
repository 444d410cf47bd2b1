#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("missing API key: expected X-API-Key or Authorization: Bearer header")]
    AuthMissing,

    #[error("invalid or inactive API key")]
    AuthInvalid,

    #[error("session {0} is owned by a different API key")]
    SessionMismatch(String),

    #[error("unknown session: {0}")]
    SessionUnknown(String),

    #[error("upstream '{server}' unavailable: {reason}")]
    UpstreamUnavailable { server: String, reason: String },

    #[error("upstream '{server}' timed out after {elapsed_ms}ms")]
    UpstreamTimeout { server: String, elapsed_ms: u64 },

    #[error("upstream '{server}' request failed: {message}")]
    Upstream { server: String, message: String },

    #[error("invalid tool name '{0}': expected '<server>__<tool>'")]
    InvalidToolName(String),

    #[error("no upstream matches tool prefix '{0}'")]
    UnknownTool(String),

    #[error("cache backend degraded: {0}")]
    CacheBackendDegraded(String),

    #[error("{scope} connection limit reached ({limit})")]
    ResourceLimit { scope: &'static str, limit: usize },
}

impl GatewayError {
    /// True for failures that must surface as an MCP error result rather
    /// than an HTTP status.
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable { .. }
                | Self::UpstreamTimeout { .. }
                | Self::Upstream { .. }
                | Self::InvalidToolName(_)
                | Self::UnknownTool(_)
        )
    }
}
