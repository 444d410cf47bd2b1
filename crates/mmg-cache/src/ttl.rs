//! Per-tool TTL policy.
//!
//! Tools are classified by name: state-mutating tools are never cached,
//! reference lookups cache for a long time, listings and status queries for
//! progressively shorter windows. Unknown tools get the configured default.

use std::collections::HashMap;
use std::time::Duration;

const REFERENCE_TTL_SECS: u64 = 1800;
const LISTING_TTL_SECS: u64 = 120;
const STATUS_TTL_SECS: u64 = 30;

/// Hints that a tool mutates state; such tools bypass the cache entirely.
const MUTATING_MARKERS: &[&str] = &[
    "create", "update", "delete", "remove", "write", "insert", "execute", "run",
    "set_", "send", "post", "put", "patch", "add", "drop", "kill", "apply",
];

const REFERENCE_MARKERS: &[&str] = &["reference", "docs", "doc_", "schema", "describe", "help"];
const LISTING_MARKERS: &[&str] = &["list", "search", "find", "browse"];
const STATUS_MARKERS: &[&str] = &["status", "state", "task", "progress", "health"];

#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_ttl: Duration,
    /// Exact-name overrides, seconds; 0 marks a tool non-cacheable.
    overrides: HashMap<String, u64>,
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, tool_name: &str, ttl_secs: u64) -> Self {
        self.overrides.insert(tool_name.to_string(), ttl_secs);
        self
    }

    /// TTL for a tool; `None` means the tool is non-cacheable and both get
    /// and set must be no-ops.
    pub fn ttl_for(&self, tool_name: &str) -> Option<Duration> {
        if let Some(&secs) = self.overrides.get(tool_name) {
            return (secs > 0).then(|| Duration::from_secs(secs));
        }

        let lower = tool_name.to_ascii_lowercase();
        if MUTATING_MARKERS.iter().any(|m| lower.contains(m)) {
            return None;
        }
        if REFERENCE_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Duration::from_secs(REFERENCE_TTL_SECS));
        }
        if LISTING_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Duration::from_secs(LISTING_TTL_SECS));
        }
        if STATUS_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Duration::from_secs(STATUS_TTL_SECS));
        }
        Some(self.default_ttl)
    }
}
