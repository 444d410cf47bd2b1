//! Repository interface consumed by the gateway core, plus an in-memory
//! implementation used by tests and single-node deployments.
//!
//! Real deployments back these traits with a relational store; the core only
//! ever sees the traits.

mod memory;
mod store;
mod types;

pub use memory::{MemoryRepository, SeedApiKey, SeedFile, SeedNamespace, SeedServer};
pub use store::{ApiKeyStore, NamespaceStore, Repository, ServerStore, ToolStore};
pub use types::{
    ApiKeyIdentity, ErrorStatus, MappingStatus, McpServerDefinition, ServerKind, ServerLaunch,
    ServerMapping, ToolMapping, is_well_formed_secret,
};
