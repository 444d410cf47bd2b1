//! Two-tier tool response cache.
//!
//! L1 is an in-process map bounded by entry count with oldest-first
//! eviction. L2 is an optional distributed key-value tier engaged only for
//! long-lived entries; its failures degrade the cache to L1-only and are
//! never surfaced to callers.

mod key;
mod l2;
mod ttl;

pub use key::{args_fingerprint, cache_key, canonical_json};
pub use ttl::TtlPolicy;

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mmg_config::CacheConfig;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use l2::{L2Envelope, RemoteKv};

/// Entries with a TTL above this threshold are mirrored into L2.
const L2_MIN_TTL: Duration = Duration::from_secs(60);
/// Fraction of entries evicted when L1 overflows.
const EVICTION_FRACTION: usize = 10;

struct CacheEntry {
    payload: Value,
    payload_bytes: u64,
    cached_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

#[derive(Default)]
struct L1State {
    entries: HashMap<String, CacheEntry>,
    approx_bytes: u64,
}

impl L1State {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.approx_bytes = self.approx_bytes.saturating_sub(entry.payload_bytes);
        Some(entry)
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        if let Some(old) = self.entries.remove(&key) {
            self.approx_bytes = self.approx_bytes.saturating_sub(old.payload_bytes);
        }
        self.approx_bytes += entry.payload_bytes;
        self.entries.insert(key, entry);
    }

    /// Evicts the oldest tenth of entries by insertion age.
    fn evict_oldest(&mut self, max_entries: usize) {
        let evict_count = (max_entries / EVICTION_FRACTION).max(1);
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);
        for (key, _) in by_age.into_iter().take(evict_count) {
            self.remove(&key);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheHealth {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub hit_rate: f64,
    pub entries: usize,
    pub memory_mb: f64,
    pub l2_connected: bool,
    pub health: CacheHealth,
}

pub struct ToolResponseCache {
    max_entries: usize,
    policy: TtlPolicy,
    l1: Mutex<L1State>,
    hits: AtomicU64,
    misses: AtomicU64,
    l2: Option<RemoteKv>,
    sweep_interval: Duration,
}

impl ToolResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_policy(config, TtlPolicy::new(config.default_ttl()))
    }

    pub fn with_policy(config: &CacheConfig, policy: TtlPolicy) -> Self {
        let l2 = config
            .l2_endpoint
            .as_ref()
            .map(|endpoint| RemoteKv::new(endpoint.clone(), config.l2_token.clone()));
        Self {
            max_entries: config.max_memory_entries.max(1),
            policy,
            l1: Mutex::new(L1State::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            l2,
            sweep_interval: config.cleanup_interval(),
        }
    }

    /// TTL the policy assigns to a tool; `None` marks it non-cacheable.
    pub fn ttl_for(&self, tool_name: &str) -> Option<Duration> {
        self.policy.ttl_for(tool_name)
    }

    /// Looks a payload up, consulting L2 on an L1 miss for long-TTL tools.
    /// Non-cacheable tools always miss without touching the counters.
    pub async fn get(&self, key: &str, tool_name: &str) -> Option<Value> {
        let ttl = self.policy.ttl_for(tool_name)?;

        let l1_result = {
            let mut l1 = self.l1.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match l1.entries.get_mut(key) {
                Some(entry) if !entry.is_expired() => {
                    entry.hit_count += 1;
                    Some(entry.payload.clone())
                }
                Some(_) => {
                    l1.remove(key);
                    None
                }
                None => None,
            }
        };
        if let Some(payload) = l1_result {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(payload);
        }

        if ttl > L2_MIN_TTL {
            if let Some(kv) = &self.l2 {
                if let Some(envelope) = kv.get(key).await {
                    if let Some(remaining) = envelope.remaining_ttl() {
                        self.store_l1(key.to_string(), envelope.payload.clone(), remaining);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(envelope.payload);
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Stores a payload under the tool's policy TTL. No-op for
    /// non-cacheable tools.
    pub async fn set(&self, key: &str, tool_name: &str, payload: Value) {
        let Some(ttl) = self.policy.ttl_for(tool_name) else {
            return;
        };

        self.store_l1(key.to_string(), payload.clone(), ttl);

        if ttl > L2_MIN_TTL {
            if let Some(kv) = &self.l2 {
                let envelope = L2Envelope::new(payload, ttl);
                kv.set(key, &envelope, ttl).await;
            }
        }
    }

    /// Drops every L1 entry whose key contains `pattern`; returns the count.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut l1 = self.l1.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let matching: Vec<String> = l1
            .entries
            .keys()
            .filter(|key| key.contains(pattern))
            .cloned()
            .collect();
        let count = matching.len();
        for key in matching {
            l1.remove(&key);
        }
        count
    }

    pub fn status(&self) -> CacheStatus {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            1.0
        } else {
            hits as f64 / lookups as f64
        };

        let (entries, approx_bytes) = {
            let l1 = self.l1.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (l1.entries.len(), l1.approx_bytes)
        };

        let health = if hit_rate >= 0.8 {
            CacheHealth::Ok
        } else if hit_rate >= 0.5 {
            CacheHealth::Degraded
        } else {
            CacheHealth::Error
        };

        CacheStatus {
            hit_rate,
            entries,
            memory_mb: approx_bytes as f64 / (1024.0 * 1024.0),
            l2_connected: self.l2.as_ref().is_some_and(|kv| kv.is_connected()),
            health,
        }
    }

    /// Removes expired L1 entries.
    pub fn sweep_expired(&self) {
        let mut l1 = self.l1.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired: Vec<String> = l1
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        let mut served_hits = 0;
        for key in expired {
            if let Some(entry) = l1.remove(&key) {
                served_hits += entry.hit_count;
            }
        }
        if served_hits > 0 {
            tracing::debug!(served_hits, "expired cache entries swept");
        }
    }

    /// Spawns the periodic expiry sweep.
    pub fn spawn_sweeper(
        self: &std::sync::Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => cache.sweep_expired(),
                }
            }
        })
    }

    fn store_l1(&self, key: String, payload: Value, ttl: Duration) {
        let payload_bytes = payload.to_string().len() as u64;
        let mut l1 = self.l1.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if l1.entries.len() >= self.max_entries {
            l1.evict_oldest(self.max_entries);
        }
        l1.insert(
            key,
            CacheEntry {
                payload,
                payload_bytes,
                cached_at: Instant::now(),
                ttl,
                hit_count: 0,
            },
        );
    }
}
