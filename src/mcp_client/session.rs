//! Protocol session — one server's process plus its JSON-RPC conversation.
//!
//! `StdioSession` implements the MCP handshake, capability discovery and
//! tool calls over a [`StdioTransport`]. The [`ToolSession`] trait is the
//! seam the session manager and tool router work against, so tests can swap
//! in doubles without spawning processes.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::errors::McpError;
use super::lifecycle::{self, format_stderr_suffix, ServerProcess};
use super::transport::{extract_result, StdioTransport};
use super::types::{
    error_codes, CapabilitySet, ConnectionState, DiscoveredCapabilities, InitializeResult,
    McpToolDefinition, ServerConnection, ServerDescriptor, SessionOptions, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages followed via `nextCursor`.
const MAX_LIST_PAGES: usize = 32;

// ─── ToolSession ─────────────────────────────────────────────────────────────

/// A live connection to one tool server.
///
/// Implementations need not serialize concurrent `call`s; callers go through
/// the session manager's per-server call lane.
#[async_trait]
pub trait ToolSession: Send + Sync {
    fn server_name(&self) -> &str;

    /// Snapshot of the connection's runtime state.
    fn connection(&self) -> ServerConnection;

    fn is_connected(&self) -> bool {
        self.connection().state == ConnectionState::Connected
    }

    /// Issue one request and wait for its correlated result.
    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError>;

    /// Re-check that the server is still reachable (process alive, pipes open).
    async fn probe(&self) -> bool {
        self.is_connected()
    }

    async fn disconnect(&self);

    /// `tools/list`, following `nextCursor` pagination.
    async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.call("tools/list", params, timeout).await?;

            let page = result.get("tools").cloned().unwrap_or_else(|| json!([]));
            let defs: Vec<McpToolDefinition> =
                serde_json::from_value(page).map_err(|e| McpError::ProtocolError {
                    server: self.server_name().to_string(),
                    reason: format!("malformed tools/list result: {e}"),
                })?;
            tools.extend(defs);

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }

        Ok(tools)
    }

    /// `tools/call`. A result flagged `isError` becomes [`McpError::ToolError`].
    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = self.call("tools/call", Some(params), timeout).await?;

        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            let message = result
                .get("content")
                .and_then(Value::as_array)
                .and_then(|items| items.iter().find_map(|i| i.get("text")))
                .and_then(Value::as_str)
                .unwrap_or("tool reported an error")
                .to_string();
            return Err(McpError::ToolError {
                tool: tool.to_string(),
                message,
            });
        }

        Ok(result)
    }
}

// ─── StdioSession ────────────────────────────────────────────────────────────

/// Mutable runtime state behind the session.
struct SessionState {
    state: ConnectionState,
    last_error: Option<String>,
    capabilities: CapabilitySet,
    discovered: DiscoveredCapabilities,
}

/// A session with a child process speaking MCP over stdio.
pub struct StdioSession {
    name: String,
    options: SessionOptions,
    process: tokio::sync::Mutex<ServerProcess>,
    transport: StdioTransport,
    state: Mutex<SessionState>,
}

impl StdioSession {
    /// Spawn the server process.
    ///
    /// The returned session is `connecting`; call [`handshake`](Self::handshake)
    /// and [`discover_capabilities`](Self::discover_capabilities) next, or use
    /// [`open`](Self::open) to do all three.
    pub async fn connect(
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<Self, McpError> {
        let (process, stdin, stdout) =
            lifecycle::spawn_process(descriptor, options.startup_grace()).await?;
        tracing::debug!(server = process.name(), pid = ?process.pid(), "session process up");

        Ok(Self {
            name: descriptor.name.clone(),
            options: options.clone(),
            process: tokio::sync::Mutex::new(process),
            transport: StdioTransport::new(&descriptor.name, stdin, stdout),
            state: Mutex::new(SessionState {
                state: ConnectionState::Connecting,
                last_error: None,
                capabilities: CapabilitySet::default(),
                discovered: DiscoveredCapabilities::default(),
            }),
        })
    }

    /// Connect, negotiate, and discover in one go.
    ///
    /// On failure the process is stopped before the error is returned.
    pub async fn open(
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<Self, McpError> {
        let session = Self::connect(descriptor, options).await?;

        let negotiated = async {
            session.handshake().await?;
            session.discover_capabilities().await
        }
        .await;

        match negotiated {
            Ok(_) => Ok(session),
            Err(e) => {
                session.disconnect().await;
                Err(e)
            }
        }
    }

    /// Perform the MCP initialization handshake.
    pub async fn handshake(&self) -> Result<CapabilitySet, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {},
        });

        let response = self
            .transport
            .request("initialize", Some(params), self.options.init_timeout())
            .await;

        let result = match response.and_then(|r| extract_result(&self.name, r)) {
            Ok(result) => result,
            Err(e) => return Err(self.fail_handshake(e).await),
        };

        let init: InitializeResult = match serde_json::from_value(result) {
            Ok(init) => init,
            Err(e) => {
                let err = McpError::ProtocolError {
                    server: self.name.clone(),
                    reason: format!("failed to parse initialize response: {e}"),
                };
                return Err(self.fail_handshake(err).await);
            }
        };

        if let Err(e) = self
            .transport
            .notify("notifications/initialized", None)
            .await
        {
            return Err(self.fail_handshake(e).await);
        }

        let capabilities = CapabilitySet {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
        };

        tracing::info!(
            server = %self.name,
            protocol = ?capabilities.protocol_version,
            server_info = ?capabilities.server_info,
            "handshake complete"
        );

        self.with_state(|s| {
            s.capabilities = capabilities.clone();
            s.state = ConnectionState::Connected;
            s.last_error = None;
        });

        Ok(capabilities)
    }

    /// `tools/list` (required) plus best-effort `resources/list` and `prompts/list`.
    pub async fn discover_capabilities(&self) -> Result<DiscoveredCapabilities, McpError> {
        let timeout = self.options.init_timeout();

        let tools = match self.list_tools(timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                self.record_error(ConnectionState::Error, &e);
                return Err(e);
            }
        };

        let resources = self.list_names("resources/list", "resources", "uri").await;
        let prompts = self.list_names("prompts/list", "prompts", "name").await;

        let discovered = DiscoveredCapabilities {
            tools,
            resources,
            prompts,
        };

        tracing::info!(
            server = %self.name,
            tools = discovered.tools.len(),
            resources = discovered.resources.len(),
            prompts = discovered.prompts.len(),
            "capabilities discovered"
        );

        self.with_state(|s| s.discovered = discovered.clone());
        Ok(discovered)
    }

    /// Best-effort listing; not every server implements these methods.
    async fn list_names(&self, method: &str, field: &str, key: &str) -> Vec<String> {
        match self.call(method, None, self.options.init_timeout()).await {
            Ok(result) => result
                .get(field)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get(key).and_then(Value::as_str))
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                tracing::debug!(server = %self.name, method, "method not supported");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(server = %self.name, method, error = %e, "optional discovery failed");
                Vec::new()
            }
        }
    }

    /// Tools found by the last discovery.
    pub fn tools(&self) -> Vec<McpToolDefinition> {
        self.with_state(|s| s.discovered.tools.clone())
    }

    async fn fail_handshake(&self, cause: McpError) -> McpError {
        let state = if matches!(cause, McpError::Timeout { .. }) {
            ConnectionState::Timeout
        } else {
            ConnectionState::Error
        };
        self.record_error(state, &cause);

        let stderr = self.process.lock().await.stderr_tail();
        McpError::HandshakeError {
            name: self.name.clone(),
            reason: format!("{cause}{}", format_stderr_suffix(&stderr)),
        }
    }

    fn record_error(&self, state: ConnectionState, error: &McpError) {
        self.with_state(|s| {
            s.state = state;
            s.last_error = Some(error.to_string());
        });
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SessionState) -> T) -> T {
        // A poisoned lock only means another thread panicked mid-update; the
        // state itself is still a plain value.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *guard)
    }
}

#[async_trait]
impl ToolSession for StdioSession {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> ServerConnection {
        let next_request_id = self.transport.peek_next_id();
        self.with_state(|s| ServerConnection {
            server: self.name.clone(),
            state: s.state,
            next_request_id,
            tools: s.discovered.tools.iter().map(|t| t.name.clone()).collect(),
            resources: s.discovered.resources.clone(),
            prompts: s.discovered.prompts.clone(),
            last_error: s.last_error.clone(),
            server_info: s.capabilities.server_info.clone(),
            protocol_version: s.capabilities.protocol_version.clone(),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let state = self.with_state(|s| s.state);
        if matches!(state, ConnectionState::Disconnected) {
            return Err(McpError::ServerUnavailable {
                name: self.name.clone(),
                reason: "session is disconnected".into(),
            });
        }

        let response = self.transport.request(method, params, timeout).await;
        if self.transport.is_closed() {
            let reason = match &response {
                Err(e) => e.to_string(),
                Ok(_) => "server pipes closed".to_string(),
            };
            self.with_state(|s| {
                s.state = ConnectionState::Error;
                s.last_error = Some(reason);
            });
        }

        extract_result(&self.name, response?)
    }

    async fn probe(&self) -> bool {
        let alive = self.process.lock().await.is_alive();
        if !alive || self.transport.is_closed() {
            self.with_state(|s| {
                if s.state == ConnectionState::Connected {
                    s.state = ConnectionState::Error;
                    s.last_error = Some("server process is no longer running".into());
                }
            });
            return false;
        }
        self.is_connected()
    }

    async fn disconnect(&self) {
        self.process
            .lock()
            .await
            .shutdown(self.options.shutdown_grace())
            .await;
        self.with_state(|s| s.state = ConnectionState::Disconnected);
        tracing::info!(server = %self.name, "disconnected");
    }
}
