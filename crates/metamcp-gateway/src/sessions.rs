//! Ownership index for streamable-HTTP sessions.
//!
//! rmcp's session manager owns the transport side of a session; this index
//! records which `(api_key, namespace)` pair minted each `mcp-session-id`
//! so the router can enforce strict ownership and idle expiry. The binding
//! is immutable for the session's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

pub struct OwnedSession {
    pub session_id: String,
    pub namespace_uuid: Uuid,
    pub api_key: String,
    pub key_uuid: Uuid,
    pub user_id: Option<Uuid>,
    pub include_inactive: bool,
    pub created_at: Instant,
    last_access: Mutex<Instant>,
}

impl OwnedSession {
    pub fn new(
        session_id: String,
        namespace_uuid: Uuid,
        api_key: String,
        key_uuid: Uuid,
        user_id: Option<Uuid>,
        include_inactive: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            namespace_uuid,
            api_key,
            key_uuid,
            user_id,
            include_inactive,
            created_at: now,
            last_access: Mutex::new(now),
        }
    }

    pub fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
    }
}

/// Why a session lookup failed; the router maps these onto HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAccess {
    Unknown,
    KeyMismatch,
    NamespaceMismatch,
}

#[derive(Default)]
pub struct SessionIndex {
    inner: RwLock<HashMap<String, Arc<OwnedSession>>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: Arc<OwnedSession>) {
        self.inner
            .write()
            .await
            .insert(entry.session_id.clone(), entry);
    }

    /// Looks a session up and enforces strict `(api_key, namespace)`
    /// ownership. A valid hit refreshes `last_access`.
    pub async fn access(
        &self,
        session_id: &str,
        api_key: &str,
        namespace_uuid: Uuid,
    ) -> Result<Arc<OwnedSession>, SessionAccess> {
        let entry = self
            .inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or(SessionAccess::Unknown)?;

        if entry.api_key != api_key {
            return Err(SessionAccess::KeyMismatch);
        }
        if entry.namespace_uuid != namespace_uuid {
            return Err(SessionAccess::NamespaceMismatch);
        }
        entry.touch();
        Ok(entry)
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<OwnedSession>> {
        self.inner.write().await.remove(session_id)
    }

    /// Removes every session owned by `api_key`.
    pub async fn remove_all_for_key(&self, api_key: &str) -> Vec<Arc<OwnedSession>> {
        let mut table = self.inner.write().await;
        let ids: Vec<String> = table
            .values()
            .filter(|entry| entry.api_key == api_key)
            .map(|entry| entry.session_id.clone())
            .collect();
        ids.into_iter().filter_map(|id| table.remove(&id)).collect()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Removes every session; shutdown hook.
    pub async fn drain_all(&self) -> Vec<Arc<OwnedSession>> {
        let mut table = self.inner.write().await;
        table.drain().map(|(_, entry)| entry).collect()
    }

    /// Removes sessions idle strictly longer than `max_idle`. A request
    /// arriving at the exact cutoff refreshes and survives.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<Arc<OwnedSession>> {
        let mut table = self.inner.write().await;
        let expired: Vec<String> = table
            .values()
            .filter(|entry| entry.idle_for() > max_idle)
            .map(|entry| entry.session_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .collect()
    }
}
