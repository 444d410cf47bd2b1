//! Per-API-key upstream connection pool.
//!
//! One bucket per API key owns that key's live upstream clients. Operations
//! on the same bucket are serialized by its mutex; distinct buckets proceed
//! in parallel. Crash callbacks carry only `(api_key, server_uuid)` identity
//! keys back to the pool, which looks the bucket up on delivery.

#[path = "pool_tests.rs"]
#[cfg(test)]
mod pool_tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use mmg_config::{PoolConfig, UpstreamConfig};
use mmg_core::GatewayError;
use mmg_repo::{McpServerDefinition, ServerLaunch};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{CrashInfo, UpstreamClient};
use crate::error_state::{ErrorTracker, spawn_identity};

/// Reserved key identity for boot-time idle-warm connections.
pub const SYSTEM_WARM_KEY: &str = "internal:system-warm";

struct CrashEvent {
    api_key: String,
    server_uuid: Uuid,
    server_name: String,
    info: CrashInfo,
}

struct PooledConnection {
    client: Arc<UpstreamClient>,
    last_access: Instant,
    created_at: Instant,
}

struct ApiKeyBucket {
    key_uuid: Uuid,
    connections: HashMap<Uuid, PooledConnection>,
    last_access: Instant,
    created_at: Instant,
}

impl ApiKeyBucket {
    fn new(key_uuid: Uuid) -> Self {
        let now = Instant::now();
        Self {
            key_uuid,
            connections: HashMap::new(),
            last_access: now,
            created_at: now,
        }
    }
}

/// Snapshot of pool pressure for health/metrics payloads.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub buckets: usize,
    pub connections: usize,
    pub max_global_connections: usize,
    pub max_connections_per_api_key: usize,
}

pub struct UpstreamPool {
    config: PoolConfig,
    upstream_config: UpstreamConfig,
    tracker: Arc<ErrorTracker>,
    buckets: RwLock<HashMap<String, Arc<Mutex<ApiKeyBucket>>>>,
    /// Definition cache consulted by warm-up and refreshed on invalidation.
    definitions: RwLock<HashMap<Uuid, McpServerDefinition>>,
    total_connections: AtomicUsize,
    crash_tx: mpsc::UnboundedSender<CrashEvent>,
}

impl UpstreamPool {
    pub fn new(
        config: PoolConfig,
        upstream_config: UpstreamConfig,
        tracker: Arc<ErrorTracker>,
    ) -> Arc<Self> {
        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel::<CrashEvent>();
        let pool = Arc::new(Self {
            config,
            upstream_config,
            tracker,
            buckets: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            total_connections: AtomicUsize::new(0),
            crash_tx,
        });

        let weak: Weak<Self> = Arc::downgrade(&pool);
        tokio::spawn(async move {
            while let Some(event) = crash_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                pool.handle_crash(event).await;
            }
        });

        pool
    }

    /// Returns the live connection for `(api_key, server)`, creating it if
    /// absent. Enforces the global and per-key caps and stdio cooldowns.
    pub async fn get_connection(
        &self,
        api_key: &str,
        key_uuid: Uuid,
        def: &McpServerDefinition,
    ) -> Result<Arc<UpstreamClient>, GatewayError> {
        let bucket = self.bucket_for(api_key, key_uuid).await;
        let mut bucket = bucket.lock().await;
        bucket.last_access = Instant::now();

        if let Some(entry) = bucket.connections.get_mut(&def.server_uuid) {
            entry.last_access = Instant::now();
            return Ok(entry.client.clone());
        }

        if bucket.connections.len() >= self.config.max_connections_per_api_key {
            return Err(GatewayError::ResourceLimit {
                scope: "per-key",
                limit: self.config.max_connections_per_api_key,
            });
        }

        if let ServerLaunch::Stdio { command, args, env, .. } = &def.launch {
            let identity = spawn_identity(command, args, env);
            if let Some(remaining) = self.tracker.cooldown_remaining(&identity).await {
                return Err(GatewayError::UpstreamUnavailable {
                    server: def.name.clone(),
                    reason: format!(
                        "spawn cooldown active ({}ms remaining)",
                        remaining.as_millis()
                    ),
                });
            }
        }

        // Reserve a global slot before connecting; release it if the
        // connection never materializes.
        let max_global = self.config.max_global_connections;
        if self
            .total_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_global).then_some(n + 1)
            })
            .is_err()
        {
            return Err(GatewayError::ResourceLimit {
                scope: "global",
                limit: max_global,
            });
        }

        let callback = {
            let crash_tx = self.crash_tx.clone();
            let api_key = api_key.to_string();
            let server_uuid = def.server_uuid;
            let server_name = def.name.clone();
            Box::new(move |info: CrashInfo| {
                let _ = crash_tx.send(CrashEvent {
                    api_key: api_key.clone(),
                    server_uuid,
                    server_name: server_name.clone(),
                    info,
                });
            })
        };

        let client = match UpstreamClient::connect(def, self.upstream_config, Some(callback)).await
        {
            Ok(client) => Arc::new(client),
            Err(error) => {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                if let ServerLaunch::Stdio { command, args, env, .. } = &def.launch {
                    let identity = spawn_identity(command, args, env);
                    self.tracker.record_launch_failure(&identity).await;
                }
                tracing::warn!(
                    server = %def.name,
                    api_key_uuid = %key_uuid,
                    error = %error,
                    "failed to connect upstream"
                );
                return Err(GatewayError::UpstreamUnavailable {
                    server: def.name.clone(),
                    reason: error.to_string(),
                });
            }
        };

        let now = Instant::now();
        bucket.connections.insert(
            def.server_uuid,
            PooledConnection {
                client: client.clone(),
                last_access: now,
                created_at: now,
            },
        );
        drop(bucket);

        self.definitions
            .write()
            .await
            .insert(def.server_uuid, def.clone());

        tracing::debug!(
            server = %def.name,
            api_key_uuid = %key_uuid,
            transport = client.transport_label(),
            "upstream connection established"
        );
        Ok(client)
    }

    /// Cached definition for a server, if any connection was ever built for
    /// it.
    pub async fn cached_definition(&self, server_uuid: Uuid) -> Option<McpServerDefinition> {
        self.definitions.read().await.get(&server_uuid).cloned()
    }

    /// Drops every bucket's connection to `server_uuid` after a definition
    /// change, replacing the cached params.
    pub async fn invalidate_server_connections(
        &self,
        server_uuid: Uuid,
        new_def: Option<McpServerDefinition>,
    ) {
        let clients = self.remove_server_entries(server_uuid).await;
        for client in &clients {
            client.shutdown().await;
        }

        let mut definitions = self.definitions.write().await;
        match new_def {
            Some(def) => {
                definitions.insert(server_uuid, def);
            }
            None => {
                definitions.remove(&server_uuid);
            }
        }
    }

    /// Same as invalidation but for a deleted server: no replacement params.
    pub async fn cleanup_server_connections(&self, server_uuid: Uuid) {
        self.invalidate_server_connections(server_uuid, None).await;
    }

    /// Closes every connection owned by `api_key` and removes its bucket.
    pub async fn cleanup_api_key(&self, api_key: &str) {
        let bucket = self.buckets.write().await.remove(api_key);
        let Some(bucket) = bucket else { return };

        let connections = {
            let mut bucket = bucket.lock().await;
            std::mem::take(&mut bucket.connections)
        };
        self.release_and_close(connections.into_values().map(|c| c.client))
            .await;
    }

    /// Evicts buckets idle longer than `max_idle_time`.
    pub async fn perform_time_based_cleanup(&self) {
        let max_idle = self.config.max_idle_time();
        let snapshot: Vec<(String, Arc<Mutex<ApiKeyBucket>>)> = self
            .buckets
            .read()
            .await
            .iter()
            .map(|(key, bucket)| (key.clone(), bucket.clone()))
            .collect();

        for (api_key, bucket) in snapshot {
            let (idle, age, key_uuid) = {
                let bucket = bucket.lock().await;
                (
                    bucket.last_access.elapsed(),
                    bucket.created_at.elapsed(),
                    bucket.key_uuid,
                )
            };
            if idle > max_idle {
                tracing::info!(
                    api_key_uuid = %key_uuid,
                    idle_secs = idle.as_secs(),
                    age_secs = age.as_secs(),
                    "evicting idle API-key bucket"
                );
                self.cleanup_api_key(&api_key).await;
            }
        }
    }

    /// Shutdown hook: drains every bucket.
    pub async fn cleanup_all(&self) {
        let keys: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        for api_key in keys {
            self.cleanup_api_key(&api_key).await;
        }
    }

    pub async fn status(&self) -> PoolStatus {
        PoolStatus {
            buckets: self.buckets.read().await.len(),
            connections: self.total_connections.load(Ordering::SeqCst),
            max_global_connections: self.config.max_global_connections,
            max_connections_per_api_key: self.config.max_connections_per_api_key,
        }
    }

    /// Spawns the periodic idle-eviction task.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.perform_time_based_cleanup().await,
                }
            }
        })
    }

    async fn bucket_for(&self, api_key: &str, key_uuid: Uuid) -> Arc<Mutex<ApiKeyBucket>> {
        if let Some(bucket) = self.buckets.read().await.get(api_key) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .await
            .entry(api_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ApiKeyBucket::new(key_uuid))))
            .clone()
    }

    async fn handle_crash(&self, event: CrashEvent) {
        self.tracker
            .record_crash(event.server_uuid, &event.server_name, event.info)
            .await;

        // A crashed command gets the same cooldown as a failed launch so
        // reconnect attempts fail fast instead of respawning immediately.
        if let Some(def) = self.cached_definition(event.server_uuid).await {
            if let ServerLaunch::Stdio { command, args, env, .. } = &def.launch {
                let identity = spawn_identity(command, args, env);
                self.tracker.record_launch_failure(&identity).await;
            }
        }

        let bucket = self.buckets.read().await.get(&event.api_key).cloned();
        let Some(bucket) = bucket else { return };

        let (removed, empty) = {
            let mut bucket = bucket.lock().await;
            let removed = bucket.connections.remove(&event.server_uuid);
            (removed, bucket.connections.is_empty())
        };

        if let Some(entry) = removed {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(
                server = %event.server_name,
                idle_secs = entry.last_access.elapsed().as_secs(),
                lifetime_secs = entry.created_at.elapsed().as_secs(),
                "dropping crashed upstream connection"
            );
            entry.client.shutdown().await;
        }
        if empty {
            // Re-check under the write lock: a concurrent get_connection may
            // have repopulated the bucket.
            let mut buckets = self.buckets.write().await;
            if let Some(bucket) = buckets.get(&event.api_key).cloned() {
                if bucket.lock().await.connections.is_empty() {
                    buckets.remove(&event.api_key);
                }
            }
        }
    }

    async fn remove_server_entries(&self, server_uuid: Uuid) -> Vec<Arc<UpstreamClient>> {
        let snapshot: Vec<Arc<Mutex<ApiKeyBucket>>> =
            self.buckets.read().await.values().cloned().collect();

        let mut clients = Vec::new();
        for bucket in snapshot {
            let mut bucket = bucket.lock().await;
            if let Some(entry) = bucket.connections.remove(&server_uuid) {
                self.total_connections.fetch_sub(1, Ordering::SeqCst);
                clients.push(entry.client);
            }
        }
        clients
    }

    async fn release_and_close<I>(&self, clients: I)
    where
        I: Iterator<Item = Arc<UpstreamClient>>,
    {
        for client in clients {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            client.shutdown().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn total_connection_count(&self) -> usize {
        self.total_connections.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn bucket_count(&self) -> usize {
        self.buckets.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn connection_idle_times(
        &self,
        api_key: &str,
    ) -> Vec<(std::time::Duration, std::time::Duration)> {
        let Some(bucket) = self.buckets.read().await.get(api_key).cloned() else {
            return Vec::new();
        };
        let bucket = bucket.lock().await;
        bucket
            .connections
            .values()
            .map(|c| (c.last_access.elapsed(), c.created_at.elapsed()))
            .collect()
    }
}
