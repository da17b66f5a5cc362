//! mcp-conductor — MCP tool discovery and multi-step workflow execution.
//!
//! Servers are child processes speaking JSON-RPC 2.0 over stdio. The
//! [`mcp_client`] layer spawns them, negotiates, discovers their tools and
//! keeps one global tool index. The [`workflow`] layer turns a list of
//! dependent tool calls into stages and runs them, feeding earlier results
//! into later arguments through `${step.field}` placeholders.
//!
//! [`Conductor`] ties both together around one configuration.

pub mod config;
pub mod events;
pub mod logging;
pub mod mcp_client;
pub mod workflow;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use config::ConductorConfig;
use events::{EventSink, TracingSink};
use mcp_client::{McpError, SessionConnector, SessionManager};
use workflow::{ToolRouter, WorkflowCoordinator, WorkflowDefinition, WorkflowError, WorkflowReport};

/// Owns the session manager and router for one configuration.
///
/// Construct once and share by reference (or `Arc`).
pub struct Conductor {
    config: ConductorConfig,
    manager: Arc<SessionManager>,
    router: Arc<ToolRouter>,
    events: Arc<dyn EventSink>,
}

impl Conductor {
    pub fn new(config: ConductorConfig) -> Self {
        Self::with_events(config, Arc::new(TracingSink))
    }

    pub fn with_events(config: ConductorConfig, events: Arc<dyn EventSink>) -> Self {
        let manager = SessionManager::new(config.session.clone(), config.registry.collision_policy)
            .with_events(Arc::clone(&events));
        Self::assemble(config, manager, events)
    }

    /// Open sessions through `connector` instead of spawning processes.
    pub fn with_connector(
        config: ConductorConfig,
        connector: Arc<dyn SessionConnector>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let manager = SessionManager::new(config.session.clone(), config.registry.collision_policy)
            .with_connector(connector)
            .with_events(Arc::clone(&events));
        Self::assemble(config, manager, events)
    }

    fn assemble(config: ConductorConfig, manager: SessionManager, events: Arc<dyn EventSink>) -> Self {
        let manager = Arc::new(manager);
        let router = Arc::new(ToolRouter::new(Arc::clone(&manager)));
        Self {
            config,
            manager,
            router,
            events,
        }
    }

    /// Load, interpolate and validate a config file, then build a conductor.
    pub fn from_config_file(path: &std::path::Path) -> Result<Self, McpError> {
        Ok(Self::new(config::load_config(path)?))
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    /// Connect every configured server. Returns how many came up.
    pub async fn start(&self) -> usize {
        let connected = self.manager.initialize_all(&self.config.servers).await;
        for warning in self.manager.collision_warnings().await {
            tracing::warn!(%warning, "tool name collision");
        }
        connected
    }

    /// A coordinator using the configured workflow defaults.
    pub fn coordinator(&self) -> WorkflowCoordinator {
        WorkflowCoordinator::new(Arc::clone(&self.router), self.config.workflow.clone())
            .with_events(Arc::clone(&self.events))
    }

    pub async fn run_workflow(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<WorkflowReport, WorkflowError> {
        self.coordinator().execute(workflow).await
    }

    /// Stop every server.
    pub async fn shutdown(&self) {
        self.manager.shutdown_all().await;
    }
}
