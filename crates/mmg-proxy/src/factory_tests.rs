use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mmg_cache::ToolResponseCache;
use mmg_config::{CacheConfig, PoolConfig, UpstreamConfig};
use mmg_repo::{
    ErrorStatus, MappingStatus, McpServerDefinition, MemoryRepository, ServerLaunch, ServerStore,
    ToolMapping,
};
use mmg_upstream::{ErrorTracker, UpstreamPool};
use rmcp::ServerHandler;
use rmcp::model::CallToolRequestParam;
use serde_json::json;
use uuid::Uuid;

use crate::context::{ProxyDeps, SessionContext};
use crate::factory::MetaMcpServer;

fn write_echo_script(dir: &Path) -> Result<std::path::PathBuf> {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}},{"name":"read_file","description":"read","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;
    make_executable(&path)?;
    Ok(path)
}

fn write_counting_script(dir: &Path, counter: &Path) -> Result<std::path::PathBuf> {
    let path = dir.join("counting-mcp.sh");
    fs::write(
        &path,
        format!(
            r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"count","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/call\"*)
      echo hit >> {counter}
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"counted"}}]}}}}\n' "$id"
      ;;
  esac
done
"#,
            counter = counter.display()
        ),
    )?;
    make_executable(&path)?;
    Ok(path)
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn stdio_def(name: &str, script: &Path) -> McpServerDefinition {
    McpServerDefinition {
        server_uuid: Uuid::new_v4(),
        name: name.to_string(),
        launch: ServerLaunch::Stdio {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: HashMap::new(),
            cwd: None,
        },
        error_status: ErrorStatus::None,
    }
}

struct Harness {
    repo: Arc<MemoryRepository>,
    deps: ProxyDeps,
    namespace: Uuid,
}

impl Harness {
    async fn with_server(def: McpServerDefinition) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let namespace = Uuid::new_v4();
        repo.upsert_server(def.clone()).await;
        repo.map_server(namespace, def.server_uuid, MappingStatus::Active)
            .await;

        let tracker = Arc::new(ErrorTracker::new(repo.clone(), Duration::from_secs(10)));
        let pool = UpstreamPool::new(
            PoolConfig::default(),
            UpstreamConfig::default(),
            tracker.clone(),
        );
        let cache = Arc::new(ToolResponseCache::new(&CacheConfig::default()));

        let deps = ProxyDeps {
            repo: repo.clone(),
            pool,
            tracker,
            cache,
        };
        Self {
            repo,
            deps,
            namespace,
        }
    }

    fn session(&self) -> MetaMcpServer {
        let cx = SessionContext {
            namespace_uuid: self.namespace,
            api_key: format!("sk_mt_{}", "t".repeat(64)),
            key_uuid: Uuid::new_v4(),
            user_id: None,
            include_inactive_servers: false,
        };
        MetaMcpServer::new(cx, &self.deps)
    }

    async fn shutdown(&self) {
        self.deps.pool.cleanup_all().await;
    }
}

fn call_request(name: &str, arguments: serde_json::Value) -> CallToolRequestParam {
    CallToolRequestParam {
        name: name.to_string().into(),
        arguments: arguments.as_object().cloned(),
    }
}

fn result_text(result: &rmcp::model::CallToolResult) -> Option<&str> {
    result.content.first()?.as_text().map(|t| t.text.as_str())
}

#[tokio::test]
async fn list_tools_prefixes_and_calls_round_trip() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_echo_script(temp.path())?;
    let harness = Harness::with_server(stdio_def("File Ops", &script)).await;
    let server = harness.session();

    let list_response = server.list_tools_internal().await?;
    let names: Vec<&str> = list_response
        .tools
        .iter()
        .map(|tool| tool.name.as_ref())
        .collect();
    assert!(names.contains(&"File_Ops__echo_tool"), "got {names:?}");
    assert!(names.contains(&"File_Ops__read_file"));

    let call_response = server
        .call_tool_internal(call_request("File_Ops__echo_tool", json!({"value": "ping"})))
        .await?;
    assert_eq!(result_text(&call_response), Some("pong"));
    assert_ne!(call_response.is_error, Some(true));

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_and_unknown_tool_names_yield_error_results() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_echo_script(temp.path())?;
    let harness = Harness::with_server(stdio_def("File Ops", &script)).await;
    let server = harness.session();

    let result = server
        .call_tool_internal(call_request("nounderscore", json!({})))
        .await?;
    assert_eq!(result.is_error, Some(true));
    assert!(
        result_text(&result).is_some_and(|text| text.contains("invalid tool name")),
        "got {result:?}"
    );

    let result = server
        .call_tool_internal(call_request("Ghost__tool", json!({})))
        .await?;
    assert_eq!(result.is_error, Some(true));
    assert!(
        result_text(&result).is_some_and(|text| text.contains("no upstream matches")),
        "got {result:?}"
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn disabled_tools_are_filtered_and_rejected() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_echo_script(temp.path())?;
    let def = stdio_def("File Ops", &script);
    let server_uuid = def.server_uuid;
    let harness = Harness::with_server(def).await;

    harness
        .repo
        .map_tool(
            harness.namespace,
            ToolMapping {
                tool_uuid: Uuid::new_v4(),
                server_uuid,
                name: "echo_tool".to_string(),
                status: MappingStatus::Inactive,
            },
        )
        .await;

    let server = harness.session();
    let list_response = server.list_tools_internal().await?;
    let names: Vec<&str> = list_response
        .tools
        .iter()
        .map(|tool| tool.name.as_ref())
        .collect();
    assert!(!names.contains(&"File_Ops__echo_tool"), "got {names:?}");
    assert!(names.contains(&"File_Ops__read_file"));

    let result = server
        .call_tool_internal(call_request("File_Ops__echo_tool", json!({})))
        .await?;
    assert_eq!(result.is_error, Some(true));
    assert!(
        result_text(&result).is_some_and(|text| text.contains("disabled")),
        "got {result:?}"
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cacheable_calls_reach_upstream_once() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let counter = temp.path().join("calls.log");
    let script = write_counting_script(temp.path(), &counter)?;
    let harness = Harness::with_server(stdio_def("Counter", &script)).await;
    let server = harness.session();

    let first = server
        .call_tool_internal(call_request("Counter__echo_tool", json!({"b": 2, "a": 1})))
        .await?;
    // Same arguments in a different key order must hit the same entry.
    let second = server
        .call_tool_internal(call_request("Counter__echo_tool", json!({"a": 1, "b": 2})))
        .await?;

    assert_eq!(
        serde_json::to_value(&first)?,
        serde_json::to_value(&second)?
    );
    let hits = fs::read_to_string(&counter)?;
    assert_eq!(hits.lines().count(), 1, "upstream saw {hits:?}");

    // Different arguments bypass the cached entry.
    server
        .call_tool_internal(call_request("Counter__echo_tool", json!({"a": 2})))
        .await?;
    let hits = fs::read_to_string(&counter)?;
    assert_eq!(hits.lines().count(), 2);

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn error_state_server_short_circuits_calls() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_echo_script(temp.path())?;
    let def = stdio_def("File Ops", &script);
    let server_uuid = def.server_uuid;
    let harness = Harness::with_server(def).await;

    harness
        .repo
        .set_error_status(server_uuid, ErrorStatus::Error)
        .await?;

    let server = harness.session();
    let result = server
        .call_tool_internal(call_request("File_Ops__echo_tool", json!({})))
        .await?;
    assert_eq!(result.is_error, Some(true));
    assert!(
        result_text(&result).is_some_and(|text| text.contains("error state; reset required")),
        "got {result:?}"
    );

    harness.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn get_info_advertises_tools_capability() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_echo_script(temp.path())?;
    let harness = Harness::with_server(stdio_def("File Ops", &script)).await;
    let server = harness.session();

    let info = server.get_info();
    assert_eq!(info.server_info.name, "metamcp-gateway");
    assert!(info.capabilities.tools.is_some());

    server.cleanup();
    harness.shutdown().await;
    Ok(())
}
