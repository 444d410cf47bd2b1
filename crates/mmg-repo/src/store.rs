use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{
    ApiKeyIdentity, ErrorStatus, McpServerDefinition, ServerMapping, ToolMapping,
};

/// Validates API-key secrets.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Returns the key identity when the secret exists and is active.
    async fn validate(&self, secret: &str) -> Result<Option<ApiKeyIdentity>>;
}

/// Read/write access to upstream server definitions.
#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn find_by_id(&self, server_uuid: Uuid) -> Result<Option<McpServerDefinition>>;
    async fn find_all(&self) -> Result<Vec<McpServerDefinition>>;
    async fn set_error_status(&self, server_uuid: Uuid, status: ErrorStatus) -> Result<()>;
}

/// Namespace membership lookups.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn namespace_exists(&self, namespace_uuid: Uuid) -> Result<bool>;

    /// Servers mapped into a namespace. Inactive mappings are returned only
    /// when `include_inactive` is set.
    async fn server_mappings(
        &self,
        namespace_uuid: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<ServerMapping>>;

    /// Deduplicated servers referenced by any ACTIVE mapping, across all
    /// namespaces. Drives boot-time connection warming.
    async fn active_server_uuids(&self) -> Result<Vec<Uuid>>;
}

/// Per-namespace tool enablement lookups.
#[async_trait]
pub trait ToolStore: Send + Sync {
    async fn tool_mappings(&self, namespace_uuid: Uuid) -> Result<Vec<ToolMapping>>;
}

/// The full repository surface the gateway consumes.
pub trait Repository: ApiKeyStore + ServerStore + NamespaceStore + ToolStore {}

impl<T> Repository for T where T: ApiKeyStore + ServerStore + NamespaceStore + ToolStore {}
