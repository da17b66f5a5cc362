//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the runtime
//! descriptors the session manager keeps for each server.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// `id` is optional so server-initiated notifications deserialize and can be
/// skipped instead of aborting the read loop.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub params_schema: serde_json::Value,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// What the handshake negotiated.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    pub protocol_version: Option<String>,
    pub server_info: Option<ServerInfo>,
    /// Raw `capabilities` object from the server.
    pub capabilities: serde_json::Value,
}

/// Everything `tools/list`, `resources/list` and `prompts/list` returned.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<McpToolDefinition>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
}

// ─── Server Descriptors ──────────────────────────────────────────────────────

/// How the client talks to a server. Only stdio is implemented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Stdio,
}

/// A configured server: identity plus how to launch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Merged over the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tools from this server are externally proxied (best-effort by default).
    #[serde(default)]
    pub remote: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerDescriptor {
    /// A local, enabled stdio server with no extra environment.
    pub fn new(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            cwd: None,
            transport: TransportKind::Stdio,
            enabled: true,
            remote: false,
        }
    }

    pub fn origin(&self) -> ToolOrigin {
        if self.remote {
            ToolOrigin::Remote
        } else {
            ToolOrigin::Local
        }
    }
}

/// Where a tool executes, set once at discovery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    Local,
    /// Proxied to an external service; failures default to best-effort.
    Remote,
}

/// A discovered tool, bound to the server that owns it.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub server: String,
    pub params_schema: serde_json::Value,
    pub description: String,
    pub origin: ToolOrigin,
}

impl ToolDescriptor {
    pub fn from_definition(server: &str, origin: ToolOrigin, def: McpToolDefinition) -> Self {
        Self {
            name: def.name,
            server: server.to_string(),
            params_schema: def.params_schema,
            description: def.description.unwrap_or_default(),
            origin,
        }
    }
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle state of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Timeout,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Point-in-time view of one server's runtime state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConnection {
    pub server: String,
    pub state: ConnectionState,
    /// The id the next request will carry.
    pub next_request_id: u64,
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    pub prompts: Vec<String>,
    pub last_error: Option<String>,
    pub server_info: Option<ServerInfo>,
    pub protocol_version: Option<String>,
}

impl ServerConnection {
    pub fn new(server: &str, state: ConnectionState) -> Self {
        Self {
            server: server.to_string(),
            state,
            next_request_id: 1,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            last_error: None,
            server_info: None,
            protocol_version: None,
        }
    }

    /// A record for a server whose connect attempt failed.
    pub fn failed(server: &str, state: ConnectionState, error: String) -> Self {
        let mut conn = Self::new(server, state);
        conn.last_error = Some(error);
        conn
    }
}

// ─── Session Options ─────────────────────────────────────────────────────────

/// Timeouts for spawning, negotiating with, and stopping servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// How long a fresh process must survive before it counts as started.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Budget for the `initialize` round trip and initial discovery.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Default per-call budget when a step does not set one.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Wait after SIGTERM before force-killing.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Cap on concurrent connect attempts (`None` = all at once).
    #[serde(default)]
    pub max_concurrent_connects: Option<usize>,
}

fn default_startup_grace_ms() -> u64 {
    500
}
fn default_init_timeout_ms() -> u64 {
    30_000
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            startup_grace_ms: default_startup_grace_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_concurrent_connects: None,
        }
    }
}

impl SessionOptions {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
