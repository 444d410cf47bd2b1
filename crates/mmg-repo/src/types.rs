use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How an upstream MCP server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Launch/connection parameters for one upstream.
///
/// The tag makes the shape structural: a stdio server carries a command and
/// never a URL, a networked server the reverse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerLaunch {
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
    },
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bearer_token: Option<String>,
    },
}

impl ServerLaunch {
    pub fn kind(&self) -> ServerKind {
        match self {
            Self::Stdio { .. } => ServerKind::Stdio,
            Self::Sse { .. } => ServerKind::Sse,
            Self::StreamableHttp { .. } => ServerKind::StreamableHttp,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Persistent error flag for an upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    #[default]
    None,
    Error,
}

/// One upstream server definition as stored by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerDefinition {
    pub server_uuid: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub launch: ServerLaunch,
    #[serde(default)]
    pub error_status: ErrorStatus,
}

impl McpServerDefinition {
    pub fn kind(&self) -> ServerKind {
        self.launch.kind()
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self.launch, ServerLaunch::Stdio { .. })
    }
}

/// Enablement state for namespace↔server and namespace↔tool mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Active,
    Inactive,
}

impl MappingStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// A server referenced by a namespace, with its resolved definition.
#[derive(Debug, Clone)]
pub struct ServerMapping {
    pub server: McpServerDefinition,
    pub status: MappingStatus,
}

/// A tool's per-namespace enablement record.
#[derive(Debug, Clone)]
pub struct ToolMapping {
    pub tool_uuid: Uuid,
    pub server_uuid: Uuid,
    pub name: String,
    pub status: MappingStatus,
}

/// Result of validating an API-key secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiKeyIdentity {
    pub key_uuid: Uuid,
    pub user_id: Option<Uuid>,
}

const SECRET_PREFIX: &str = "sk_mt_";
const SECRET_BODY_LEN: usize = 64;

/// Checks the `sk_mt_` + 64 base62 chars secret format without consulting
/// the store.
pub fn is_well_formed_secret(secret: &str) -> bool {
    let Some(body) = secret.strip_prefix(SECRET_PREFIX) else {
        return false;
    };
    body.len() == SECRET_BODY_LEN && body.chars().all(|c| c.is_ascii_alphanumeric())
}
