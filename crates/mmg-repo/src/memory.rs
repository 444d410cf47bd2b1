use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{ApiKeyStore, NamespaceStore, ServerStore, ToolStore};
use crate::types::{
    ApiKeyIdentity, ErrorStatus, MappingStatus, McpServerDefinition, ServerMapping, ToolMapping,
    is_well_formed_secret,
};

/// In-memory repository backing the store traits.
///
/// Used directly by tests and by single-node deployments seeded from a TOML
/// file. Mutators mirror what the external CRUD surface would do so the core
/// can be exercised without a database.
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    servers: HashMap<Uuid, McpServerDefinition>,
    /// namespace -> ordered server mappings (order is mapping order, which
    /// breaks prefix-resolution ties).
    namespaces: HashMap<Uuid, Vec<(Uuid, MappingStatus)>>,
    tools: HashMap<Uuid, Vec<ToolMapping>>,
    api_keys: HashMap<String, ApiKeyRecord>,
}

#[derive(Debug, Clone)]
struct ApiKeyRecord {
    key_uuid: Uuid,
    user_id: Option<Uuid>,
    is_active: bool,
}

/// TOML seed format: `[[servers]]`, `[[namespaces]]`, `[[api_keys]]`.
#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub servers: Vec<SeedServer>,
    #[serde(default)]
    pub namespaces: Vec<SeedNamespace>,
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
}

#[derive(Debug, Deserialize)]
pub struct SeedServer {
    #[serde(default = "Uuid::new_v4")]
    pub server_uuid: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub launch: crate::types::ServerLaunch,
}

#[derive(Debug, Deserialize)]
pub struct SeedNamespace {
    pub namespace_uuid: Uuid,
    /// Server names, resolved against `[[servers]]` entries.
    pub servers: Vec<String>,
    #[serde(default)]
    pub inactive_servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SeedApiKey {
    pub secret: String,
    #[serde(default = "Uuid::new_v4")]
    pub key_uuid: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a seed file and builds a populated repository.
    pub async fn from_seed_path(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read seed file: {}", path.display()))?;
        let seed: SeedFile = toml::from_str(&raw)
            .with_context(|| format!("failed to parse seed file: {}", path.display()))?;
        Self::from_seed(seed).await
    }

    pub async fn from_seed(seed: SeedFile) -> Result<Self> {
        let repo = Self::new();

        let mut by_name = HashMap::new();
        for server in seed.servers {
            let def = McpServerDefinition {
                server_uuid: server.server_uuid,
                name: server.name.clone(),
                launch: server.launch,
                error_status: ErrorStatus::None,
            };
            by_name.insert(server.name, server.server_uuid);
            repo.upsert_server(def).await;
        }

        for ns in seed.namespaces {
            for name in &ns.servers {
                let uuid = *by_name
                    .get(name)
                    .with_context(|| format!("namespace references unknown server '{name}'"))?;
                repo.map_server(ns.namespace_uuid, uuid, MappingStatus::Active)
                    .await;
            }
            for name in &ns.inactive_servers {
                let uuid = *by_name
                    .get(name)
                    .with_context(|| format!("namespace references unknown server '{name}'"))?;
                repo.map_server(ns.namespace_uuid, uuid, MappingStatus::Inactive)
                    .await;
            }
        }

        for key in seed.api_keys {
            if !is_well_formed_secret(&key.secret) {
                bail!("malformed API-key secret for key {}", key.key_uuid);
            }
            repo.insert_api_key(key.secret, key.key_uuid, key.user_id, key.is_active)
                .await;
        }

        Ok(repo)
    }

    pub async fn upsert_server(&self, def: McpServerDefinition) {
        self.inner.write().await.servers.insert(def.server_uuid, def);
    }

    pub async fn map_server(&self, namespace: Uuid, server: Uuid, status: MappingStatus) {
        self.inner
            .write()
            .await
            .namespaces
            .entry(namespace)
            .or_default()
            .push((server, status));
    }

    pub async fn map_tool(&self, namespace: Uuid, mapping: ToolMapping) {
        self.inner
            .write()
            .await
            .tools
            .entry(namespace)
            .or_default()
            .push(mapping);
    }

    pub async fn set_tool_status(&self, namespace: Uuid, tool_name: &str, status: MappingStatus) {
        let mut state = self.inner.write().await;
        if let Some(mappings) = state.tools.get_mut(&namespace) {
            for mapping in mappings.iter_mut().filter(|m| m.name == tool_name) {
                mapping.status = status;
            }
        }
    }

    pub async fn insert_api_key(
        &self,
        secret: String,
        key_uuid: Uuid,
        user_id: Option<Uuid>,
        is_active: bool,
    ) {
        self.inner.write().await.api_keys.insert(
            secret,
            ApiKeyRecord {
                key_uuid,
                user_id,
                is_active,
            },
        );
    }
}

#[async_trait]
impl ApiKeyStore for MemoryRepository {
    async fn validate(&self, secret: &str) -> Result<Option<ApiKeyIdentity>> {
        let state = self.inner.read().await;
        Ok(state.api_keys.get(secret).and_then(|record| {
            record.is_active.then_some(ApiKeyIdentity {
                key_uuid: record.key_uuid,
                user_id: record.user_id,
            })
        }))
    }
}

#[async_trait]
impl ServerStore for MemoryRepository {
    async fn find_by_id(&self, server_uuid: Uuid) -> Result<Option<McpServerDefinition>> {
        Ok(self.inner.read().await.servers.get(&server_uuid).cloned())
    }

    async fn find_all(&self) -> Result<Vec<McpServerDefinition>> {
        Ok(self.inner.read().await.servers.values().cloned().collect())
    }

    async fn set_error_status(&self, server_uuid: Uuid, status: ErrorStatus) -> Result<()> {
        let mut state = self.inner.write().await;
        match state.servers.get_mut(&server_uuid) {
            Some(server) => {
                server.error_status = status;
                Ok(())
            }
            None => bail!("unknown server: {server_uuid}"),
        }
    }
}

#[async_trait]
impl NamespaceStore for MemoryRepository {
    async fn namespace_exists(&self, namespace_uuid: Uuid) -> Result<bool> {
        Ok(self.inner.read().await.namespaces.contains_key(&namespace_uuid))
    }

    async fn server_mappings(
        &self,
        namespace_uuid: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<ServerMapping>> {
        let state = self.inner.read().await;
        let Some(entries) = state.namespaces.get(&namespace_uuid) else {
            return Ok(Vec::new());
        };

        let mut mappings = Vec::new();
        for (server_uuid, status) in entries {
            if !include_inactive && !status.is_active() {
                continue;
            }
            if let Some(server) = state.servers.get(server_uuid) {
                mappings.push(ServerMapping {
                    server: server.clone(),
                    status: *status,
                });
            }
        }
        Ok(mappings)
    }

    async fn active_server_uuids(&self) -> Result<Vec<Uuid>> {
        let state = self.inner.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut uuids = Vec::new();
        for entries in state.namespaces.values() {
            for (server_uuid, status) in entries {
                if status.is_active() && seen.insert(*server_uuid) {
                    uuids.push(*server_uuid);
                }
            }
        }
        Ok(uuids)
    }
}

#[async_trait]
impl ToolStore for MemoryRepository {
    async fn tool_mappings(&self, namespace_uuid: Uuid) -> Result<Vec<ToolMapping>> {
        Ok(self
            .inner
            .read()
            .await
            .tools
            .get(&namespace_uuid)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServerLaunch;

    fn stdio_server(name: &str) -> McpServerDefinition {
        McpServerDefinition {
            server_uuid: Uuid::new_v4(),
            name: name.to_string(),
            launch: ServerLaunch::Stdio {
                command: "true".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            error_status: ErrorStatus::None,
        }
    }

    fn test_secret() -> String {
        format!("sk_mt_{}", "a".repeat(64))
    }

    #[tokio::test]
    async fn validate_rejects_unknown_and_inactive_keys() -> Result<()> {
        let repo = MemoryRepository::new();
        let key_uuid = Uuid::new_v4();
        repo.insert_api_key(test_secret(), key_uuid, None, true).await;

        let identity = repo.validate(&test_secret()).await?;
        assert_eq!(identity.map(|i| i.key_uuid), Some(key_uuid));
        assert!(repo.validate("sk_mt_missing").await?.is_none());

        repo.insert_api_key(test_secret(), key_uuid, None, false).await;
        assert!(repo.validate(&test_secret()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn server_mappings_filter_inactive_and_keep_order() -> Result<()> {
        let repo = MemoryRepository::new();
        let ns = Uuid::new_v4();
        let first = stdio_server("first");
        let second = stdio_server("second");
        let first_uuid = first.server_uuid;
        let second_uuid = second.server_uuid;
        repo.upsert_server(first).await;
        repo.upsert_server(second).await;
        repo.map_server(ns, first_uuid, MappingStatus::Active).await;
        repo.map_server(ns, second_uuid, MappingStatus::Inactive).await;

        let active = repo.server_mappings(ns, false).await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].server.server_uuid, first_uuid);

        let all = repo.server_mappings(ns, true).await?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].server.server_uuid, first_uuid);
        assert_eq!(all[1].server.server_uuid, second_uuid);
        Ok(())
    }

    #[tokio::test]
    async fn set_error_status_round_trips() -> Result<()> {
        let repo = MemoryRepository::new();
        let server = stdio_server("crashy");
        let uuid = server.server_uuid;
        repo.upsert_server(server).await;

        repo.set_error_status(uuid, ErrorStatus::Error).await?;
        let stored = repo.find_by_id(uuid).await?.unwrap();
        assert_eq!(stored.error_status, ErrorStatus::Error);

        assert!(repo.set_error_status(Uuid::new_v4(), ErrorStatus::None).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn seed_file_parses_and_links_namespaces() -> Result<()> {
        let ns = Uuid::new_v4();
        let raw = format!(
            r#"
            [[servers]]
            name = "File Ops"
            type = "stdio"
            command = "npx"
            args = ["-y", "file-ops-mcp"]

            [[servers]]
            name = "docs"
            type = "streamable_http"
            url = "https://docs.example.com/mcp"

            [[namespaces]]
            namespace_uuid = "{ns}"
            servers = ["File Ops"]
            inactive_servers = ["docs"]

            [[api_keys]]
            secret = "sk_mt_{body}"
            "#,
            body = "b".repeat(64),
        );
        let seed: SeedFile = toml::from_str(&raw)?;
        let repo = MemoryRepository::from_seed(seed).await?;

        assert!(repo.namespace_exists(ns).await?);
        let mappings = repo.server_mappings(ns, true).await?;
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].server.name, "File Ops");
        assert_eq!(mappings[1].status, MappingStatus::Inactive);

        let secret = format!("sk_mt_{}", "b".repeat(64));
        assert!(repo.validate(&secret).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn seed_rejects_malformed_secret() {
        let seed: SeedFile = toml::from_str(
            r#"
            [[api_keys]]
            secret = "not-a-key"
            "#,
        )
        .unwrap();
        assert!(MemoryRepository::from_seed(seed).await.is_err());
    }
}
