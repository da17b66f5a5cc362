//! Tool registry — aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - Tool lookup by name and the global `tool → server` index
//! - Deterministic handling of tools exposed by more than one server
//! - The list of every provider of a tool, for fallback routing
//! - Structural validation of tool call arguments against the schema

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── Collision Policy ────────────────────────────────────────────────────────

/// Which server owns a tool name exposed by several servers.
///
/// Servers are registered in configuration order, so both choices are
/// deterministic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// The server registered later takes the name over.
    #[default]
    LastWins,
    /// The first server to register a name keeps it.
    FirstWins,
}

/// A recorded name collision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCollision {
    pub tool: String,
    /// Server that owns the name after the collision.
    pub kept: String,
    /// Server whose registration lost.
    pub shadowed: String,
}

impl std::fmt::Display for ToolCollision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tool '{}' is exposed by '{}' and '{}'; routing to '{}'",
            self.tool, self.shadowed, self.kept, self.kept
        )
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all MCP servers.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    policy: CollisionPolicy,
    /// `tool_name → descriptor of the owning server's tool`.
    tools: HashMap<String, ToolDescriptor>,
    /// `tool_name → every server exposing it`, in registration order.
    providers: HashMap<String, Vec<ToolDescriptor>>,
    collisions: Vec<ToolCollision>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Register tools from a server.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<ToolDescriptor>) {
        for tool in tools {
            let name = tool.name.clone();

            let providers = self.providers.entry(name.clone()).or_default();
            providers.retain(|p| p.server != server_name);
            providers.push(tool.clone());

            match self.tools.get(&name) {
                Some(existing) if existing.server != server_name => {
                    let previous = existing.server.clone();
                    let collision = match self.policy {
                        CollisionPolicy::LastWins => {
                            self.tools.insert(name.clone(), tool);
                            ToolCollision {
                                tool: name,
                                kept: server_name.to_string(),
                                shadowed: previous,
                            }
                        }
                        CollisionPolicy::FirstWins => ToolCollision {
                            tool: name,
                            kept: previous,
                            shadowed: server_name.to_string(),
                        },
                    };
                    tracing::warn!(%collision, "duplicate tool name across servers");
                    self.collisions.push(collision);
                }
                _ => {
                    self.tools.insert(name, tool);
                }
            }
        }
    }

    /// Remove all tools belonging to a server.
    ///
    /// A name it owned passes to a remaining provider chosen by the policy.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.providers.retain(|_, providers| {
            providers.retain(|p| p.server != server_name);
            !providers.is_empty()
        });

        let orphaned: Vec<String> = self
            .tools
            .iter()
            .filter(|(_, def)| def.server == server_name)
            .map(|(name, _)| name.clone())
            .collect();

        for name in orphaned {
            self.tools.remove(&name);
            let successor = self.providers.get(&name).and_then(|p| match self.policy {
                CollisionPolicy::LastWins => p.last(),
                CollisionPolicy::FirstWins => p.first(),
            });
            if let Some(successor) = successor.cloned() {
                tracing::info!(tool = %name, server = %successor.server, "tool ownership moved");
                self.tools.insert(name, successor);
            }
        }

        self.collisions
            .retain(|c| c.kept != server_name && c.shadowed != server_name);
    }

    /// Look up a tool by name.
    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Get the server name that owns a tool.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.tools.get(tool_name).map(|def| def.server.as_str())
    }

    /// Every server exposing `tool_name`, in registration order.
    pub fn providers(&self, tool_name: &str) -> Vec<&str> {
        self.providers
            .get(tool_name)
            .map(|p| p.iter().map(|d| d.server.as_str()).collect())
            .unwrap_or_default()
    }

    /// The tool as exposed by a specific server.
    pub fn tool_on_server(&self, tool_name: &str, server_name: &str) -> Option<&ToolDescriptor> {
        self.providers
            .get(tool_name)
            .and_then(|p| p.iter().find(|d| d.server == server_name))
    }

    /// The global `tool → server` index.
    pub fn tool_index(&self) -> HashMap<String, String> {
        self.tools
            .iter()
            .map(|(name, def)| (name.clone(), def.server.clone()))
            .collect()
    }

    /// Collisions seen since the registry was built.
    pub fn collisions(&self) -> &[ToolCollision] {
        &self.collisions
    }

    /// Return all registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools owned by a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|def| def.server == server_name)
            .count()
    }

    /// Validate a tool call: tool exists and required arguments are present.
    ///
    /// This is a basic structural check: required fields present at the top
    /// level. Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(
        def: &ToolDescriptor,
        arguments: &serde_json::Value,
    ) -> Result<(), McpError> {
        let Some(required) = def.params_schema.get("required").and_then(|r| r.as_array()) else {
            return Ok(());
        };

        let args_obj = arguments.as_object();
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            let has_field = args_obj
                .map(|obj| obj.contains_key(field_name))
                .unwrap_or(false);
            if !has_field {
                return Err(McpError::InvalidArguments {
                    tool: def.name.clone(),
                    reason: format!("missing required field: '{field_name}'"),
                });
            }
        }

        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
