//! Aggregation core: the handlers that fan out to upstream servers, the
//! middleware pipeline around them, and the per-session MetaMCP server
//! factory.

mod context;
mod factory;
mod handlers;
mod middleware;

pub use context::{ProxyDeps, SessionContext};
pub use factory::MetaMcpServer;
pub use handlers::{AggregateListTools, DispatchCallTool, tool_error_result};
pub use middleware::{
    CacheToolCalls, CallToolHandler, FilterToolsCall, FilterToolsList, ListToolsHandler,
    SharedCallHandler, SharedListHandler, compose_call, compose_list,
};
