//! MCP client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
///
/// Every variant carries the server or tool it concerns so callers can log
/// and report without extra context.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process failed to start or exited during the startup grace period.
    #[error("failed to start server '{name}': {reason}")]
    ConnectionError { name: String, reason: String },

    /// The `initialize` negotiation failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeError { name: String, reason: String },

    /// Malformed, missing, or out-of-band response; also raised when the pipes close.
    #[error("protocol error for server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// No correlated response arrived within the budget.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported `isError: true`.
    #[error("tool '{tool}' reported an error: {message}")]
    ToolError { tool: String, message: String },

    /// Tool not present in the aggregated index.
    #[error("unknown tool: '{name}'")]
    ToolNotFound { name: String },

    /// The owning server (and every alternative) is not connected.
    #[error("server '{name}' is unavailable: {reason}")]
    ServerUnavailable { name: String, reason: String },

    /// Tool call arguments failed the structural schema check.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The caller stopped waiting (workflow deadline).
    #[error("call to '{tool}' cancelled: {reason}")]
    Cancelled { tool: String, reason: String },

    /// Configuration error (bad file, unknown server name).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Whether a caller with a retry budget should try again.
    ///
    /// Lookup and validation failures are deterministic, so retrying them only
    /// burns the budget.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::ServerError { .. }
                | Self::ToolError { .. }
                | Self::ProtocolError { .. }
                | Self::ServerUnavailable { .. }
                | Self::ConnectionError { .. }
        )
    }
}
