//! Conductor configuration and workflow definition loading.
//!
//! The config file is YAML. `${VAR}` and `${VAR:-default}` are interpolated
//! from the environment before parsing (a `~` in a default expands to the
//! home directory). Workflow files are *not* interpolated: their `${...}`
//! strings are step placeholders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::logging::LogOptions;
use crate::mcp_client::errors::McpError;
use crate::mcp_client::registry::CollisionPolicy;
use crate::mcp_client::types::{ServerDescriptor, SessionOptions};
use crate::workflow::errors::WorkflowError;
use crate::workflow::types::{WorkflowDefinition, WorkflowOptions};

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "conductor.yaml";

/// Environment variable that points at a config file directly.
pub const CONFIG_ENV_VAR: &str = "MCP_CONDUCTOR_CONFIG";

// ─── Config Types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Servers in priority order; the tool index is built in this order.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub session: SessionOptions,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub workflow: WorkflowOptions,
    #[serde(default)]
    pub logging: LogOptions,
}

impl ConductorConfig {
    /// Reject configurations the manager cannot work with.
    pub fn validate(&self) -> Result<(), McpError> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: "server with empty name".into(),
                });
            }
            if !seen.insert(server.name.as_str()) {
                return Err(McpError::ConfigError {
                    reason: format!("server '{}' is configured twice", server.name),
                });
            }
            if server.command.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("server '{}' has no command", server.name),
                });
            }
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.name == name)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `MCP_CONDUCTOR_CONFIG` wins if it names an existing file; otherwise the
/// search walks upward from `start` looking for `conductor.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not name a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Read, interpolate, parse, and validate a config file.
pub fn load_config(path: &Path) -> Result<ConductorConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "configuration loaded"
    );
    Ok(config)
}

/// Parse config text (with env interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<ConductorConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);

    let config: ConductorConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

/// Parse a workflow definition from YAML.
pub fn parse_workflow_yaml(raw: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml::from_str(raw).map_err(|e| WorkflowError::InvalidDefinition {
        reason: format!("yaml: {e}"),
    })
}

/// Parse a workflow definition from JSON.
pub fn parse_workflow_json(raw: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_json::from_str(raw).map_err(|e| WorkflowError::InvalidDefinition {
        reason: format!("json: {e}"),
    })
}

/// Load a workflow file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let raw = std::fs::read_to_string(path).map_err(|e| WorkflowError::InvalidDefinition {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_workflow_json(&raw)
    } else {
        parse_workflow_yaml(&raw)
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::SuccessMode;
    use std::io::Write;

    const SAMPLE: &str = r#"
servers:
  - name: files
    command: ${__CONDUCTOR_TEST_FILES_BIN__:-files-server}
    args: ["--root", "${__CONDUCTOR_TEST_ROOT__:-~/data}"]
  - name: web
    command: web-proxy
    remote: true
    env:
      API_KEY: secret
session:
  init_timeout_ms: 5000
registry:
  collision_policy: first_wins
workflow:
  retries: 2
  backoff_ms: 100
  success_mode: strict
"#;

    #[test]
    fn test_parse_full_config() {
        std::env::remove_var("__CONDUCTOR_TEST_FILES_BIN__");
        std::env::remove_var("__CONDUCTOR_TEST_ROOT__");
        let config = parse_config(SAMPLE).unwrap();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].command, "files-server");
        assert!(!config.servers[0].args[1].starts_with('~'));
        assert!(config.server("web").unwrap().remote);
        assert_eq!(config.session.init_timeout_ms, 5000);
        assert_eq!(config.session.startup_grace_ms, 500);
        assert_eq!(config.registry.collision_policy, CollisionPolicy::FirstWins);
        assert_eq!(config.workflow.max_attempts, 2);
        assert_eq!(config.workflow.max_parallel, 8);
        assert_eq!(config.workflow.success_mode, SuccessMode::Strict);
    }

    #[test]
    fn test_env_var_overrides_default() {
        std::env::set_var("__CONDUCTOR_TEST_CMD__", "/opt/bin/server");
        let config = parse_config(
            "servers:\n  - name: a\n    command: ${__CONDUCTOR_TEST_CMD__:-fallback}\n",
        )
        .unwrap();
        assert_eq!(config.servers[0].command, "/opt/bin/server");
        std::env::remove_var("__CONDUCTOR_TEST_CMD__");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("{}").unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.registry.collision_policy, CollisionPolicy::LastWins);
        assert_eq!(config.workflow.max_attempts, 3);
    }

    #[test]
    fn test_duplicate_server_rejected() {
        let err = parse_config(
            "servers:\n  - {name: a, command: x}\n  - {name: a, command: y}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "servers:\n  - name: files\n    command: files-server").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.servers[0].name, "files");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/conductor.yaml")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{}").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join(CONFIG_FILE_NAME));
    }

    #[test]
    fn test_workflow_placeholders_survive_parsing() {
        let yaml = r#"
name: digest
steps:
  - id: fetch
    tool: fetch_url
    arguments: {url: "https://example.com"}
  - id: store
    tool: write_record
    arguments: {body: "${fetch.content}"}
"#;
        let wf = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(wf.steps[1].arguments["body"], "${fetch.content}");

        let json = serde_json::to_string(&wf).unwrap();
        assert_eq!(parse_workflow_json(&json).unwrap(), wf);
    }

    #[test]
    fn test_load_workflow_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.json");
        std::fs::write(&path, r#"{"name": "j", "steps": [{"id": "a", "tool": "t"}]}"#).unwrap();
        assert_eq!(load_workflow(&path).unwrap().steps.len(), 1);

        assert!(matches!(
            parse_workflow_yaml("steps: [oops"),
            Err(WorkflowError::InvalidDefinition { .. })
        ));
    }
}
