//! In-memory tool sessions for unit tests.
//!
//! `FakeSession` answers `tools/list` and `tools/call` from a scripted
//! handler, records every call with timestamps, and flags any overlap between
//! two calls on the same session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::manager::{ConnectedSession, SessionConnector};
use crate::mcp_client::session::ToolSession;
use crate::mcp_client::types::{
    ConnectionState, McpToolDefinition, ServerConnection, ServerDescriptor, SessionOptions,
};

/// `(tool, arguments, attempt)` → result. `attempt` counts calls to that tool
/// on this session, starting at 1.
pub type Handler = Arc<dyn Fn(&str, &Value, u32) -> Result<Value, McpError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub tool: String,
    pub arguments: Value,
    pub started: Instant,
    pub finished: Instant,
}

pub struct FakeSession {
    name: String,
    tools: Mutex<Vec<McpToolDefinition>>,
    handler: Handler,
    delay: Duration,
    disconnect_delay: Duration,
    state: Mutex<ConnectionState>,
    alive: AtomicBool,
    in_flight: AtomicUsize,
    overlapped: AtomicBool,
    attempts: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl FakeSession {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Mutex::new(Vec::new()),
            handler: Arc::new(|tool, args, _| Ok(json!({ "tool": tool, "arguments": args }))),
            delay: Duration::ZERO,
            disconnect_delay: Duration::ZERO,
            state: Mutex::new(ConnectionState::Connected),
            alive: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            attempts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(self, tool: &str) -> Self {
        self.with_tool_schema(tool, json!({ "type": "object" }))
    }

    pub fn with_tool_schema(self, tool: &str, schema: Value) -> Self {
        self.tools.lock().unwrap().push(McpToolDefinition {
            name: tool.to_string(),
            description: Some(format!("{tool} (fake)")),
            params_schema: schema,
        });
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `disconnect` take this long, like a server slow to exit.
    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&str, &Value, u32) -> Result<Value, McpError> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Replace the advertised tool list (seen by the next `tools/list`).
    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock().unwrap() = tools
            .iter()
            .map(|t| McpToolDefinition {
                name: t.to_string(),
                description: None,
                params_schema: json!({ "type": "object" }),
            })
            .collect();
    }

    pub fn tool_definitions(&self) -> Vec<McpToolDefinition> {
        self.tools.lock().unwrap().clone()
    }

    /// Simulate the server process dying.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Simulate a connection that is up but not usable.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Whether two calls were ever in flight at once.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn unavailable(&self) -> McpError {
        McpError::ProtocolError {
            server: self.name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

#[async_trait]
impl ToolSession for FakeSession {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> ServerConnection {
        let mut conn = ServerConnection::new(&self.name, *self.state.lock().unwrap());
        conn.tools = self
            .tools
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        conn
    }

    async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }

        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let started = Instant::now();

        let slept = tokio::time::timeout(timeout, tokio::time::sleep(self.delay)).await;

        let params = params.unwrap_or(Value::Null);
        let result = if slept.is_err() {
            Err(McpError::Timeout {
                server: self.name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        } else {
            match method {
                "tools/list" => Ok(json!({ "tools": self.tool_definitions() })),
                "tools/call" => {
                    let tool = params["name"].as_str().unwrap_or_default().to_string();
                    let arguments = params["arguments"].clone();
                    let attempt = {
                        let mut attempts = self.attempts.lock().unwrap();
                        let n = attempts.entry(tool.clone()).or_insert(0);
                        *n += 1;
                        *n
                    };
                    let result = (self.handler)(&tool, &arguments, attempt);
                    self.calls.lock().unwrap().push(CallRecord {
                        tool,
                        arguments,
                        started,
                        finished: Instant::now(),
                    });
                    result
                }
                other => Err(McpError::ServerError {
                    code: -32601,
                    message: format!("method not found: {other}"),
                    data: None,
                }),
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn probe(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.is_connected()
    }

    async fn disconnect(&self) {
        tokio::time::sleep(self.disconnect_delay).await;
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Hands out pre-built fake sessions by server name; unknown names fail
/// like a process that exits during startup.
#[derive(Default)]
pub struct FakeConnector {
    sessions: Mutex<HashMap<String, Arc<FakeSession>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, session: Arc<FakeSession>) -> Self {
        self.insert(session);
        self
    }

    pub fn insert(&self, session: Arc<FakeSession>) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.server_name().to_string(), session);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for FakeConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        _options: &SessionOptions,
    ) -> Result<ConnectedSession, McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let session = self.sessions.lock().unwrap().get(&descriptor.name).cloned();
        match session {
            Some(session) => {
                session.set_state(ConnectionState::Connected);
                let tools = session.tool_definitions();
                Ok(ConnectedSession {
                    session,
                    tools,
                })
            }
            None => Err(McpError::ConnectionError {
                name: descriptor.name.clone(),
                reason: "process exited during startup (exit status: 1)".into(),
            }),
        }
    }
}

/// A descriptor for a fake server.
pub fn descriptor(name: &str) -> ServerDescriptor {
    ServerDescriptor::new(name, "fake-server", &[])
}
