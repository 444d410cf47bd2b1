//! Optional distributed cache tier over a REST key-value API.
//!
//! The backend speaks an Upstash-style protocol: `GET /get/{key}` and
//! `POST /set/{key}?EX={ttl}` with a bearer token. Entries are stored as an
//! envelope carrying the payload and its absolute expiry so a promotion into
//! L1 can compute the remaining TTL. Backend failures are never fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

const L2_KEY_PREFIX: &str = "tool-cache:";
const L2_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct L2Envelope {
    pub payload: Value,
    pub expires_at_epoch_secs: u64,
}

impl L2Envelope {
    pub(crate) fn new(payload: Value, ttl: Duration) -> Self {
        Self {
            payload,
            expires_at_epoch_secs: epoch_secs() + ttl.as_secs(),
        }
    }

    /// Remaining lifetime, `None` when already expired.
    pub(crate) fn remaining_ttl(&self) -> Option<Duration> {
        let now = epoch_secs();
        (self.expires_at_epoch_secs > now)
            .then(|| Duration::from_secs(self.expires_at_epoch_secs - now))
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) struct RemoteKv {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    connected: AtomicBool,
}

#[derive(Deserialize)]
struct KvGetResponse {
    result: Option<String>,
}

impl RemoteKv {
    pub(crate) fn new(base_url: String, token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(L2_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            // Unverified until the first successful round-trip.
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) async fn get(&self, key: &str) -> Option<L2Envelope> {
        let url = format!("{}/get/{L2_KEY_PREFIX}{key}", self.base_url);
        let request = self.authorized(self.client.get(&url));

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                self.mark_degraded("get", &error.to_string());
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        self.connected.store(true, Ordering::Relaxed);

        let body: KvGetResponse = response.json().await.ok()?;
        let raw = body.result?;
        serde_json::from_str(&raw).ok()
    }

    pub(crate) async fn set(&self, key: &str, envelope: &L2Envelope, ttl: Duration) {
        let Ok(raw) = serde_json::to_string(envelope) else {
            return;
        };
        let url = format!(
            "{}/set/{L2_KEY_PREFIX}{key}?EX={}",
            self.base_url,
            ttl.as_secs()
        );
        let request = self.authorized(self.client.post(&url)).body(raw);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.connected.store(true, Ordering::Relaxed);
            }
            Ok(response) => {
                self.mark_degraded("set", &format!("status {}", response.status()));
            }
            Err(error) => {
                self.mark_degraded("set", &error.to_string());
            }
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn mark_degraded(&self, op: &str, reason: &str) {
        if self.connected.swap(false, Ordering::Relaxed) {
            tracing::warn!(op, reason, "L2 cache degraded; continuing L1-only");
        } else {
            tracing::debug!(op, reason, "L2 cache request failed");
        }
    }
}
