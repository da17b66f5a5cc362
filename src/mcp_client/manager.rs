//! Session manager — owns every server session and the aggregated tool index.
//!
//! Sessions are keyed by server name. Each one gets a call lane, an async
//! mutex held for the full duration of any call to that server, so calls to
//! one server never overlap while calls to different servers run in parallel.
//! Registry changes take the state write lock; lookups take the read lock and
//! release it before awaiting a call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, Semaphore};

use super::errors::McpError;
use super::registry::{CollisionPolicy, ToolRegistry};
use super::session::{StdioSession, ToolSession};
use super::types::{
    ConnectionState, McpToolDefinition, ServerConnection, ServerDescriptor, SessionOptions,
    ToolDescriptor, ToolOrigin,
};
use crate::events::{EventSink, TracingSink, WorkflowEvent};

// ─── Connector ───────────────────────────────────────────────────────────────

/// A freshly opened session plus the tools it advertised.
pub struct ConnectedSession {
    pub session: Arc<dyn ToolSession>,
    pub tools: Vec<McpToolDefinition>,
}

/// Opens sessions for descriptors. The default spawns stdio processes.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<ConnectedSession, McpError>;
}

/// Spawns the server process and runs handshake plus discovery.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdioConnector;

#[async_trait]
impl SessionConnector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
        options: &SessionOptions,
    ) -> Result<ConnectedSession, McpError> {
        let session = StdioSession::open(descriptor, options).await?;
        let tools = session.tools();
        Ok(ConnectedSession {
            session: Arc::new(session),
            tools,
        })
    }
}

// ─── Handles ─────────────────────────────────────────────────────────────────

/// A routable reference to one server's session.
#[derive(Clone)]
pub struct SessionHandle {
    pub server: String,
    pub origin: ToolOrigin,
    session: Arc<dyn ToolSession>,
    lane: Arc<Mutex<()>>,
}

impl SessionHandle {
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// `tools/call` with the server's call lane held for the whole exchange.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let _lane = self.lane.lock().await;
        self.session.call_tool(tool, arguments, timeout).await
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolDefinition>, McpError> {
        let _lane = self.lane.lock().await;
        self.session.list_tools(timeout).await
    }

    async fn probe(&self) -> bool {
        let _lane = self.lane.lock().await;
        self.session.probe().await
    }

    async fn disconnect(&self) {
        let _lane = self.lane.lock().await;
        self.session.disconnect().await;
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

struct ServerSlot {
    handle: SessionHandle,
    tools: Vec<ToolDescriptor>,
}

struct ManagerState {
    /// Configured servers, in configuration order.
    descriptors: Vec<ServerDescriptor>,
    /// Server names in index-building order: configured first, then any
    /// sessions registered directly.
    order: Vec<String>,
    slots: HashMap<String, ServerSlot>,
    /// Last failed connect attempt per server.
    failures: HashMap<String, ServerConnection>,
    registry: ToolRegistry,
}

impl ManagerState {
    fn descriptor(&self, name: &str) -> Option<&ServerDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    fn remember(&mut self, descriptor: &ServerDescriptor) {
        match self.descriptors.iter_mut().find(|d| d.name == descriptor.name) {
            Some(existing) => *existing = descriptor.clone(),
            None => self.descriptors.push(descriptor.clone()),
        }
        if !self.order.contains(&descriptor.name) {
            self.order.push(descriptor.name.clone());
        }
    }

    fn install(&mut self, name: &str, origin: ToolOrigin, connected: ConnectedSession) -> usize {
        let tools: Vec<ToolDescriptor> = connected
            .tools
            .into_iter()
            .map(|def| ToolDescriptor::from_definition(name, origin, def))
            .collect();
        let count = tools.len();

        self.failures.remove(name);
        self.slots.insert(
            name.to_string(),
            ServerSlot {
                handle: SessionHandle {
                    server: name.to_string(),
                    origin,
                    session: connected.session,
                    lane: Arc::new(Mutex::new(())),
                },
                tools,
            },
        );
        count
    }

    fn record_failure(&mut self, name: &str, error: &McpError) {
        let state = match error {
            McpError::Timeout { .. } => ConnectionState::Timeout,
            _ => ConnectionState::Error,
        };
        self.failures.insert(
            name.to_string(),
            ServerConnection::failed(name, state, error.to_string()),
        );
    }

    /// Rebuild the tool index from scratch, walking servers in order.
    fn rebuild_index(&mut self) {
        let mut registry = ToolRegistry::new(self.registry.policy());
        for name in &self.order {
            if let Some(slot) = self.slots.get(name) {
                registry.register_server_tools(name, slot.tools.clone());
            }
        }
        self.registry = registry;
    }
}

// ─── Refresh Summary ─────────────────────────────────────────────────────────

/// What a [`SessionManager::refresh`] pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    /// Live sessions whose tool list was re-read.
    pub refreshed: Vec<String>,
    /// Sessions found dead and removed.
    pub removed: Vec<String>,
    /// Configured servers that were down and came back.
    pub reconnected: Vec<String>,
    /// `(server, error)` for every failed probe, listing, or reconnect.
    pub failures: Vec<(String, String)>,
    /// Tools in the index afterwards.
    pub tools: usize,
}

// ─── SessionManager ──────────────────────────────────────────────────────────

/// Owns all server sessions and the global tool index.
pub struct SessionManager {
    options: SessionOptions,
    connector: Arc<dyn SessionConnector>,
    events: Arc<dyn EventSink>,
    state: RwLock<ManagerState>,
}

impl SessionManager {
    pub fn new(options: SessionOptions, policy: CollisionPolicy) -> Self {
        Self {
            options,
            connector: Arc::new(StdioConnector),
            events: Arc::new(TracingSink),
            state: RwLock::new(ManagerState {
                descriptors: Vec::new(),
                order: Vec::new(),
                slots: HashMap::new(),
                failures: HashMap::new(),
                registry: ToolRegistry::new(policy),
            }),
        }
    }

    /// Use a different way of opening sessions.
    pub fn with_connector(mut self, connector: Arc<dyn SessionConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled descriptor concurrently.
    ///
    /// Returns how many servers are connected afterwards among `descriptors`.
    /// A failed server is recorded and reported; it never affects the others.
    pub async fn initialize_all(&self, descriptors: &[ServerDescriptor]) -> usize {
        let limit = self.options.max_concurrent_connects.map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut pending = Vec::new();
        {
            let mut state = self.state.write().await;
            for descriptor in descriptors {
                state.remember(descriptor);
                if !descriptor.enabled {
                    tracing::debug!(server = %descriptor.name, "server disabled, skipping");
                    continue;
                }
                if state.slots.contains_key(&descriptor.name) {
                    tracing::debug!(server = %descriptor.name, "already connected");
                    continue;
                }
                pending.push(descriptor.clone());
            }
        }

        let tasks = pending.into_iter().map(|descriptor| {
            let connector = Arc::clone(&self.connector);
            let options = self.options.clone();
            let limit = limit.clone();
            let name = descriptor.name.clone();
            let task = tokio::spawn(async move {
                let _permit = match limit {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                let result = connector.connect(&descriptor, &options).await;
                (descriptor, result)
            });
            async move { (name, task.await) }
        });

        let outcomes = futures::future::join_all(tasks).await;

        {
            let mut state = self.state.write().await;
            for (name, outcome) in outcomes {
                match outcome {
                    Ok((descriptor, Ok(connected))) => {
                        let tools = state.install(&name, descriptor.origin(), connected);
                        tracing::info!(server = %name, tools, "server connected");
                        self.events
                            .emit(&WorkflowEvent::ServerConnected { server: name, tools });
                    }
                    Ok((_, Err(e))) => self.connect_failed(&mut state, &name, &e),
                    Err(join_err) => {
                        let e = McpError::ConnectionError {
                            name: name.clone(),
                            reason: format!("connect task failed: {join_err}"),
                        };
                        self.connect_failed(&mut state, &name, &e);
                    }
                }
            }
            state.rebuild_index();
        }

        let state = self.state.read().await;
        let connected = descriptors
            .iter()
            .filter(|d| state.slots.contains_key(&d.name))
            .count();
        tracing::info!(
            connected,
            configured = descriptors.len(),
            tools = state.registry.len(),
            "servers initialized"
        );
        connected
    }

    fn connect_failed(&self, state: &mut ManagerState, name: &str, error: &McpError) {
        tracing::warn!(server = %name, error = %error, "server failed to connect");
        state.record_failure(name, error);
        self.events.emit(&WorkflowEvent::ServerConnectionFailed {
            server: name.to_string(),
            error: error.to_string(),
        });
    }

    /// Connect one configured server. Returns its tool count.
    pub async fn connect_server(&self, name: &str) -> Result<usize, McpError> {
        let descriptor = {
            let state = self.state.read().await;
            if let Some(slot) = state.slots.get(name) {
                return Ok(slot.tools.len());
            }
            state.descriptor(name).cloned().ok_or(McpError::ConfigError {
                reason: format!("no configuration for server '{name}'"),
            })?
        };

        let result = self.connector.connect(&descriptor, &self.options).await;

        let mut state = self.state.write().await;
        match result {
            Ok(connected) => {
                // A concurrent refresh may have connected it first
                if let Some(slot) = state.slots.get(name) {
                    let tools = slot.tools.len();
                    drop(state);
                    connected.session.disconnect().await;
                    return Ok(tools);
                }
                let tools = state.install(name, descriptor.origin(), connected);
                state.rebuild_index();
                tracing::info!(server = %name, tools, "server connected");
                self.events.emit(&WorkflowEvent::ServerConnected {
                    server: name.to_string(),
                    tools,
                });
                Ok(tools)
            }
            Err(e) => {
                self.connect_failed(&mut state, name, &e);
                Err(e)
            }
        }
    }

    /// Add an already-open session under `name`, replacing any existing one.
    pub async fn register_session(
        &self,
        name: &str,
        origin: ToolOrigin,
        session: Arc<dyn ToolSession>,
        tools: Vec<McpToolDefinition>,
    ) -> usize {
        let (replaced, count) = {
            let mut state = self.state.write().await;
            if !state.order.iter().any(|n| n == name) {
                state.order.push(name.to_string());
            }
            let replaced = state.slots.remove(name).map(|slot| slot.handle);
            let count = state.install(name, origin, ConnectedSession { session, tools });
            state.rebuild_index();
            (replaced, count)
        };

        if let Some(old) = replaced {
            old.disconnect().await;
        }
        self.events.emit(&WorkflowEvent::ServerConnected {
            server: name.to_string(),
            tools: count,
        });
        count
    }

    /// Stop one server and drop its tools from the index.
    ///
    /// Returns `false` when no session by that name was connected.
    pub async fn disconnect_server(&self, name: &str) -> bool {
        let handle = {
            let mut state = self.state.write().await;
            let Some(slot) = state.slots.remove(name) else {
                return false;
            };
            state.registry.unregister_server(name);
            slot.handle
        };

        handle.disconnect().await;
        self.events.emit(&WorkflowEvent::ServerDisconnected {
            server: name.to_string(),
        });
        true
    }

    /// Stop every server and clear the index.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut state = self.state.write().await;
            let handles = state.slots.drain().map(|(_, slot)| slot.handle).collect();
            state.rebuild_index();
            handles
        };

        let names: Vec<String> = handles.iter().map(|h| h.server.clone()).collect();
        futures::future::join_all(handles.iter().map(|h| h.disconnect())).await;

        for server in names {
            self.events
                .emit(&WorkflowEvent::ServerDisconnected { server });
        }
        tracing::info!("all servers shut down");
    }

    /// Re-probe every server and rebuild the tool index.
    ///
    /// Each server is probed through its call lane, so in-flight calls finish
    /// first. Dead servers are removed, live ones re-list their tools, and
    /// configured servers that are down get one reconnect attempt.
    pub async fn refresh(&self) -> RefreshSummary {
        let mut summary = RefreshSummary::default();

        let (live, down): (Vec<SessionHandle>, Vec<ServerDescriptor>) = {
            let state = self.state.read().await;
            let live = state
                .order
                .iter()
                .filter_map(|name| state.slots.get(name).map(|s| s.handle.clone()))
                .collect();
            let down = state
                .descriptors
                .iter()
                .filter(|d| d.enabled && !state.slots.contains_key(&d.name))
                .cloned()
                .collect();
            (live, down)
        };

        let mut relisted: Vec<(SessionHandle, Vec<McpToolDefinition>)> = Vec::new();
        let mut dead: Vec<SessionHandle> = Vec::new();

        for handle in live {
            if !handle.probe().await {
                tracing::warn!(server = %handle.server, "server no longer reachable");
                summary
                    .failures
                    .push((handle.server.clone(), "server no longer reachable".into()));
                dead.push(handle);
                continue;
            }
            match handle.list_tools(self.options.init_timeout()).await {
                Ok(tools) => relisted.push((handle, tools)),
                Err(e) => {
                    tracing::warn!(server = %handle.server, error = %e, "tools/list failed during refresh");
                    summary.failures.push((handle.server.clone(), e.to_string()));
                }
            }
        }

        for handle in &dead {
            handle.disconnect().await;
        }

        let mut reconnected = Vec::new();
        for descriptor in down {
            match self.connector.connect(&descriptor, &self.options).await {
                Ok(connected) => reconnected.push((descriptor, connected)),
                Err(e) => summary.failures.push((descriptor.name.clone(), e.to_string())),
            }
        }

        let mut state = self.state.write().await;
        for handle in dead {
            // Only drop the slot if it still holds the session we probed
            let same = state
                .slots
                .get(&handle.server)
                .is_some_and(|slot| Arc::ptr_eq(&slot.handle.lane, &handle.lane));
            if same {
                state.slots.remove(&handle.server);
                state.failures.insert(
                    handle.server.clone(),
                    ServerConnection::failed(
                        &handle.server,
                        ConnectionState::Error,
                        "server no longer reachable".into(),
                    ),
                );
                self.events.emit(&WorkflowEvent::ServerDisconnected {
                    server: handle.server.clone(),
                });
                summary.removed.push(handle.server);
            }
        }

        for (handle, tools) in relisted {
            if let Some(slot) = state.slots.get_mut(&handle.server) {
                slot.tools = tools
                    .into_iter()
                    .map(|def| ToolDescriptor::from_definition(&handle.server, handle.origin, def))
                    .collect();
                summary.refreshed.push(handle.server);
            }
        }

        let mut duplicates = Vec::new();
        for (descriptor, connected) in reconnected {
            if state.slots.contains_key(&descriptor.name) {
                duplicates.push(connected.session);
                continue;
            }
            let tools = state.install(&descriptor.name, descriptor.origin(), connected);
            self.events.emit(&WorkflowEvent::ServerConnected {
                server: descriptor.name.clone(),
                tools,
            });
            summary.reconnected.push(descriptor.name);
        }

        state.rebuild_index();
        summary.tools = state.registry.len();
        drop(state);

        for session in duplicates {
            session.disconnect().await;
        }

        tracing::info!(
            refreshed = summary.refreshed.len(),
            removed = summary.removed.len(),
            reconnected = summary.reconnected.len(),
            tools = summary.tools,
            "registry refreshed"
        );
        summary
    }

    // ─── Lookups ─────────────────────────────────────────────────────────

    /// The global `tool → server` index.
    pub async fn tool_index(&self) -> HashMap<String, String> {
        self.state.read().await.registry.tool_index()
    }

    pub async fn tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.state.read().await.registry.get_tool(name).cloned()
    }

    /// The tool as exposed by one specific server.
    pub async fn tool_on_server(&self, tool: &str, server: &str) -> Option<ToolDescriptor> {
        self.state
            .read()
            .await
            .registry
            .tool_on_server(tool, server)
            .cloned()
    }

    /// Every connected server exposing `tool`, in index-building order.
    pub async fn providers(&self, tool: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .registry
            .providers(tool)
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Human-readable warnings for every tool name collision.
    pub async fn collision_warnings(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .registry
            .collisions()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub async fn handle(&self, server: &str) -> Option<SessionHandle> {
        self.state
            .read()
            .await
            .slots
            .get(server)
            .map(|slot| slot.handle.clone())
    }

    pub async fn is_connected(&self, server: &str) -> bool {
        self.handle(server)
            .await
            .is_some_and(|handle| handle.is_connected())
    }

    pub async fn tools_for_server(&self, server: &str) -> usize {
        self.state
            .read()
            .await
            .slots
            .get(server)
            .map_or(0, |slot| slot.tools.len())
    }

    /// Snapshots for every known server, in index-building order.
    pub async fn connections(&self) -> Vec<ServerConnection> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .map(|name| {
                if let Some(slot) = state.slots.get(name) {
                    slot.handle.session.connection()
                } else if let Some(failure) = state.failures.get(name) {
                    failure.clone()
                } else {
                    ServerConnection::new(name, ConnectionState::Disconnected)
                }
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
