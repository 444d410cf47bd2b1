use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mmg_config::{PoolConfig, UpstreamConfig};
use mmg_core::GatewayError;
use mmg_repo::{ErrorStatus, McpServerDefinition, MemoryRepository, ServerLaunch, ServerStore};
use uuid::Uuid;

use crate::error_state::ErrorTracker;
use crate::pool::UpstreamPool;

fn write_mock_script(dir: &Path) -> Result<std::path::PathBuf> {
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
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

fn write_crashing_script(dir: &Path) -> Result<std::path::PathBuf> {
    let path = dir.join("crash-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"crash","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      exit 7
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
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

fn pool_config(per_key: usize, global: usize) -> PoolConfig {
    PoolConfig {
        max_idle_time_secs: 7200,
        cleanup_interval_secs: 1800,
        max_connections_per_api_key: per_key,
        max_global_connections: global,
    }
}

fn build_pool(
    repo: &Arc<MemoryRepository>,
    config: PoolConfig,
    cooldown: Duration,
) -> Arc<UpstreamPool> {
    let tracker = Arc::new(ErrorTracker::new(repo.clone(), cooldown));
    UpstreamPool::new(config, UpstreamConfig::default(), tracker)
}

fn secret(tag: char) -> String {
    format!("sk_mt_{}", tag.to_string().repeat(64))
}

#[tokio::test]
async fn get_connection_reuses_existing_entry() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 100), Duration::from_secs(10));
    let def = stdio_def("mock", &script);

    let key = secret('a');
    let first = pool.get_connection(&key, Uuid::new_v4(), &def).await?;
    let second = pool.get_connection(&key, Uuid::new_v4(), &def).await?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.total_connection_count(), 1);
    assert_eq!(pool.connection_idle_times(&key).await.len(), 1);

    pool.cleanup_all().await;
    assert_eq!(pool.total_connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn per_key_limit_rejects_additional_servers() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(1, 100), Duration::from_secs(10));

    let key = secret('a');
    pool.get_connection(&key, Uuid::new_v4(), &stdio_def("one", &script))
        .await?;
    let err = pool
        .get_connection(&key, Uuid::new_v4(), &stdio_def("two", &script))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ResourceLimit { scope: "per-key", limit: 1 }
    ));

    pool.cleanup_all().await;
    Ok(())
}

#[tokio::test]
async fn global_limit_rejects_across_buckets() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 1), Duration::from_secs(10));

    pool.get_connection(&secret('a'), Uuid::new_v4(), &stdio_def("one", &script))
        .await?;
    let err = pool
        .get_connection(&secret('b'), Uuid::new_v4(), &stdio_def("two", &script))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::ResourceLimit { scope: "global", limit: 1 }
    ));

    pool.cleanup_all().await;
    Ok(())
}

#[tokio::test]
async fn cleanup_api_key_removes_bucket_and_connections() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 100), Duration::from_secs(10));

    let key = secret('a');
    pool.get_connection(&key, Uuid::new_v4(), &stdio_def("one", &script))
        .await?;
    assert_eq!(pool.bucket_count().await, 1);

    pool.cleanup_api_key(&key).await;
    assert_eq!(pool.bucket_count().await, 0);
    assert_eq!(pool.total_connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn idle_buckets_are_evicted_by_time_based_cleanup() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let mut config = pool_config(50, 100);
    config.max_idle_time_secs = 0;
    let pool = build_pool(&repo, config, Duration::from_secs(10));

    pool.get_connection(&secret('a'), Uuid::new_v4(), &stdio_def("one", &script))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.perform_time_based_cleanup().await;
    assert_eq!(pool.bucket_count().await, 0);
    assert_eq!(pool.total_connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn invalidation_drops_server_across_buckets() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 100), Duration::from_secs(10));
    let def = stdio_def("shared", &script);

    pool.get_connection(&secret('a'), Uuid::new_v4(), &def).await?;
    pool.get_connection(&secret('b'), Uuid::new_v4(), &def).await?;
    assert_eq!(pool.total_connection_count(), 2);

    pool.cleanup_server_connections(def.server_uuid).await;
    assert_eq!(pool.total_connection_count(), 0);
    assert!(pool.cached_definition(def.server_uuid).await.is_none());
    Ok(())
}

#[tokio::test]
async fn failed_launch_starts_cooldown() -> Result<()> {
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 100), Duration::from_secs(10));
    let def = McpServerDefinition {
        server_uuid: Uuid::new_v4(),
        name: "broken".to_string(),
        launch: ServerLaunch::Stdio {
            command: "/nonexistent/mcp-server".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        },
        error_status: ErrorStatus::None,
    };

    let first = pool
        .get_connection(&secret('a'), Uuid::new_v4(), &def)
        .await
        .unwrap_err();
    assert!(matches!(first, GatewayError::UpstreamUnavailable { .. }));

    let second = pool
        .get_connection(&secret('a'), Uuid::new_v4(), &def)
        .await
        .unwrap_err();
    match second {
        GatewayError::UpstreamUnavailable { reason, .. } => {
            assert!(reason.contains("cooldown"), "unexpected reason: {reason}");
        }
        other => panic!("expected cooldown rejection, got {other}"),
    }
    assert_eq!(pool.total_connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn crash_marks_error_state_and_removes_connection() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_crashing_script(temp.path())?;
    let repo = Arc::new(MemoryRepository::new());
    let pool = build_pool(&repo, pool_config(50, 100), Duration::from_secs(10));
    let def = stdio_def("crashy", &script);
    repo.upsert_server(def.clone()).await;

    // Handshake succeeds; the server then exits on the initialized
    // notification, which must fire the crash path.
    let _ = pool.get_connection(&secret('a'), Uuid::new_v4(), &def).await;

    let mut marked = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = repo.find_by_id(def.server_uuid).await?.unwrap();
        if stored.error_status == ErrorStatus::Error && pool.total_connection_count() == 0 {
            marked = true;
            break;
        }
    }
    assert!(marked, "crash was not recorded within the timeout");
    assert_eq!(pool.bucket_count().await, 0);

    // Reconnect attempts against the crashed identity fail fast while the
    // cooldown is active.
    let retry = pool
        .get_connection(&secret('a'), Uuid::new_v4(), &def)
        .await
        .unwrap_err();
    match retry {
        GatewayError::UpstreamUnavailable { reason, .. } => {
            assert!(reason.contains("cooldown"), "unexpected reason: {reason}");
        }
        other => panic!("expected cooldown rejection, got {other}"),
    }
    Ok(())
}
