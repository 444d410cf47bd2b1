//! Shared error kinds and naming helpers used across the gateway crates.

pub mod error;
pub mod naming;

pub use error::GatewayError;
pub use naming::{TOOL_SEPARATOR, prefixed_tool_name, sanitize_server_name, split_prefixed_name};
