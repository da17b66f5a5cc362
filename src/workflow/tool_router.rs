//! ToolRouter — dispatches workflow tool calls to MCP servers.
//!
//! Handles:
//! - Server selection (explicit hint, else the global tool index)
//! - Falling back to another provider when the chosen server is down
//! - Structural argument validation
//! - Per-server serialization through the manager's call lanes
//! - Rolling per-server counters (calls, successes, latency)

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::manager::{SessionHandle, SessionManager};
use crate::mcp_client::registry::ToolRegistry;
use crate::mcp_client::types::ToolOrigin;

/// Rolling counters for one server. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub calls: u64,
    pub successes: u64,
    pub total_latency_ms: u64,
}

impl ServerStats {
    pub fn average_latency_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_latency_ms / self.calls
        }
    }
}

/// A completed tool call.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool: String,
    pub server: String,
    pub result: Value,
    pub elapsed: Duration,
}

pub struct ToolRouter {
    manager: Arc<SessionManager>,
    default_timeout: Duration,
    stats: Mutex<HashMap<String, ServerStats>>,
}

impl ToolRouter {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let default_timeout = manager.options().call_timeout();
        Self {
            manager,
            default_timeout,
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// The server a call would target before availability is considered.
    pub async fn route(&self, tool: &str, server_hint: Option<&str>) -> Option<String> {
        match server_hint {
            Some(server) => Some(server.to_string()),
            None => self.manager.tool_index().await.remove(tool),
        }
    }

    /// Where `tool` executes, if it is known.
    pub async fn tool_origin(&self, tool: &str, server_hint: Option<&str>) -> Option<ToolOrigin> {
        let def = match server_hint {
            Some(server) => self.manager.tool_on_server(tool, server).await,
            None => self.manager.tool(tool).await,
        };
        def.map(|d| d.origin)
    }

    /// Call `tool` with `arguments`.
    ///
    /// `timeout` defaults to the session call timeout.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        server_hint: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ToolInvocation, McpError> {
        let handle = self.select(tool, server_hint).await?;

        let def = self
            .manager
            .tool_on_server(tool, &handle.server)
            .await
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool.to_string(),
            })?;
        ToolRegistry::validate_tool_call(&def, &arguments)?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        let outcome = handle.call_tool(tool, arguments, timeout).await;
        let elapsed = start.elapsed();

        self.record(&handle.server, outcome.is_ok(), elapsed);

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    tool,
                    server = %handle.server,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "tool call succeeded"
                );
                Ok(ToolInvocation {
                    tool: tool.to_string(),
                    server: handle.server,
                    result,
                    elapsed,
                })
            }
            Err(e) => {
                tracing::debug!(tool, server = %handle.server, error = %e, "tool call failed");
                Err(e)
            }
        }
    }

    /// Pick a connected session for `tool`.
    ///
    /// The hinted or indexed server is used when it is connected. Otherwise
    /// every other provider of the tool is tried in configuration order and
    /// the first connected one wins.
    async fn select(&self, tool: &str, server_hint: Option<&str>) -> Result<SessionHandle, McpError> {
        let primary = match server_hint {
            Some(server) => server.to_string(),
            None => self
                .manager
                .tool(tool)
                .await
                .map(|def| def.server)
                .ok_or_else(|| McpError::ToolNotFound {
                    name: tool.to_string(),
                })?,
        };

        if let Some(handle) = self.manager.handle(&primary).await {
            if handle.is_connected() {
                if self.manager.tool_on_server(tool, &primary).await.is_none() {
                    return Err(McpError::ToolNotFound {
                        name: format!("{tool} (on server '{primary}')"),
                    });
                }
                return Ok(handle);
            }
        }

        for alternative in self.manager.providers(tool).await {
            if alternative == primary {
                continue;
            }
            if let Some(handle) = self.manager.handle(&alternative).await {
                if handle.is_connected() {
                    tracing::info!(tool, from = %primary, to = %alternative, "routing to alternative server");
                    return Ok(handle);
                }
            }
        }

        Err(McpError::ServerUnavailable {
            name: primary,
            reason: format!("not connected and no other server provides '{tool}'"),
        })
    }

    fn record(&self, server: &str, success: bool, elapsed: Duration) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = stats.entry(server.to_string()).or_default();
        entry.calls += 1;
        if success {
            entry.successes += 1;
        }
        entry.total_latency_ms += elapsed.as_millis() as u64;
    }

    /// Snapshot of the per-server counters.
    pub fn stats(&self) -> HashMap<String, ServerStats> {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
