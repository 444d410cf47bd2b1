//! Upstream connection layer: spawning and connecting to MCP servers,
//! tracking their error state, and pooling live clients per API key.

mod client;
mod error_state;
mod pool;
mod stdio_filter;

pub use client::{CrashInfo, UpstreamClient};
pub use error_state::{ErrorTracker, spawn_identity};
pub use pool::{PoolStatus, SYSTEM_WARM_KEY, UpstreamPool};
