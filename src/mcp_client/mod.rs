//! MCP Client — JSON-RPC over stdio for tool-providing server processes.
//!
//! This module handles:
//! - Spawning server child processes and stopping them again
//! - JSON-RPC 2.0 communication over process stdio
//! - The `initialize` handshake and capability discovery
//! - Aggregating tools across servers into one index
//! - Per-server call serialization

pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use errors::McpError;
pub use manager::{
    ConnectedSession, RefreshSummary, SessionConnector, SessionHandle, SessionManager,
    StdioConnector,
};
pub use registry::{CollisionPolicy, ToolCollision, ToolRegistry};
pub use session::{StdioSession, ToolSession};
pub use types::{
    ConnectionState, McpToolDefinition, ServerConnection, ServerDescriptor, SessionOptions,
    ToolDescriptor, ToolOrigin,
};
