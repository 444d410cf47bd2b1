//! Per-server error state and spawn cooldowns.
//!
//! Crashes flip the repository's `error_status` flag; failed stdio launches
//! additionally start a cooldown keyed by the spawn identity so repeated
//! attempts against a broken command fail fast without forking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use mmg_repo::{ErrorStatus, ServerStore};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::CrashInfo;

/// Deterministic identity of a stdio spawn: command, args, and environment
/// (sorted, so insertion order does not matter).
pub fn spawn_identity(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hasher.update([0]);
    for arg in args {
        hasher.update(arg.as_bytes());
        hasher.update([0]);
    }
    let mut pairs: Vec<_> = env.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in pairs {
        hasher.update(key.as_bytes());
        hasher.update([1]);
        hasher.update(value.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct ErrorTracker {
    servers: Arc<dyn ServerStore>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<String, Instant>>,
}

impl ErrorTracker {
    pub fn new(servers: Arc<dyn ServerStore>, cooldown: Duration) -> Self {
        Self {
            servers,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    /// Marks the server `ERROR` after a crash callback.
    pub async fn record_crash(&self, server_uuid: Uuid, server_name: &str, info: CrashInfo) {
        tracing::error!(
            server = %server_name,
            server_uuid = %server_uuid,
            exit_code = ?info.exit_code,
            signal = ?info.signal,
            "upstream crashed; marking error state"
        );
        if let Err(error) = self
            .servers
            .set_error_status(server_uuid, ErrorStatus::Error)
            .await
        {
            tracing::warn!(
                server_uuid = %server_uuid,
                error = %error,
                "failed to persist error status"
            );
        }
    }

    pub async fn is_server_in_error_state(&self, server_uuid: Uuid) -> Result<bool> {
        Ok(self
            .servers
            .find_by_id(server_uuid)
            .await?
            .map(|server| server.error_status == ErrorStatus::Error)
            .unwrap_or(false))
    }

    pub async fn reset_server_error_state(&self, server_uuid: Uuid) -> Result<()> {
        self.servers
            .set_error_status(server_uuid, ErrorStatus::None)
            .await
    }

    /// Starts (or restarts) the cooldown window for a spawn identity.
    pub async fn record_launch_failure(&self, identity: &str) {
        self.cooldowns
            .lock()
            .await
            .insert(identity.to_string(), Instant::now());
    }

    /// Remaining cooldown for an identity, pruning expired entries.
    pub async fn cooldown_remaining(&self, identity: &str) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.retain(|_, started| started.elapsed() < self.cooldown);
        cooldowns
            .get(identity)
            .map(|started| self.cooldown.saturating_sub(started.elapsed()))
    }
}
