//! Workflow definitions, execution options, and run reports.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Definitions ─────────────────────────────────────────────────────────────

/// One tool call in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the workflow. Must be non-empty and contain no `.`.
    pub id: String,
    pub tool: String,
    /// Preferred server; otherwise the tool index decides.
    #[serde(default)]
    pub server: Option<String>,
    /// Tool arguments. Strings of the form `${step}` or `${step.field}` are
    /// replaced by earlier results.
    #[serde(default = "empty_arguments")]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-attempt call timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Total attempts including the first.
    #[serde(default, alias = "retries")]
    pub max_attempts: Option<u32>,
    /// Overrides the origin-based default.
    #[serde(default)]
    pub critical: Option<bool>,
}

fn empty_arguments() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl WorkflowStep {
    pub fn new(id: &str, tool: &str) -> Self {
        Self {
            id: id.to_string(),
            tool: tool.to_string(),
            server: None,
            arguments: empty_arguments(),
            depends_on: Vec::new(),
            timeout_ms: None,
            max_attempts: None,
            critical: None,
        }
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn on_server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: &str, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            steps,
        }
    }
}

// ─── Options ─────────────────────────────────────────────────────────────────

/// How the overall `success` flag is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessMode {
    /// No failures, or more completed steps than failed ones.
    #[default]
    Majority,
    /// No failures and nothing skipped.
    Strict,
}

impl SuccessMode {
    pub fn evaluate(self, completed: usize, failed: usize, skipped: usize) -> bool {
        match self {
            Self::Majority => failed == 0 || completed > failed,
            Self::Strict => failed == 0 && skipped == 0,
        }
    }
}

/// Execution defaults, overridable per step where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Attempts per step when the step does not say.
    #[serde(default = "default_max_attempts", alias = "retries")]
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Steps of one stage running at once.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Wall-clock budget for a whole run.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub success_mode: SuccessMode,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    250
}
fn default_max_parallel() -> usize {
    8
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_parallel: default_max_parallel(),
            deadline_ms: None,
            success_mode: SuccessMode::default(),
        }
    }
}

impl WorkflowOptions {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// The final outcome of one step. Written once per run.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub tool: String,
    /// Server that handled (or was meant to handle) the call.
    pub server: Option<String>,
    pub success: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 1-based number of the attempt that produced this result.
    pub attempt: u32,
    pub critical: bool,
    pub stage: usize,
    pub execution_time_ms: u64,
}

/// Per-server share of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerUtilization {
    pub steps: usize,
    pub successes: usize,
    pub busy_ms: u64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Steps never started because the run halted.
    pub skipped_steps: Vec<String>,
    pub server_utilization: BTreeMap<String, ServerUtilization>,
    pub total_time_ms: u64,
    /// Stage order, then definition order.
    pub results: Vec<StepResult>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub halted: bool,
    pub success: bool,
}

impl WorkflowReport {
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_deserializes_with_defaults_and_alias() {
        let yaml = r#"
id: store
tool: write_record
retries: 5
depends_on: [fetch]
arguments:
  body: "${fetch.content}"
"#;
        let step: WorkflowStep = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.max_attempts, Some(5));
        assert_eq!(step.depends_on, vec!["fetch"]);
        assert_eq!(step.arguments["body"], "${fetch.content}");
        assert!(step.server.is_none());
        assert!(step.critical.is_none());

        let bare: WorkflowStep = serde_yaml::from_str("id: a\ntool: t\n").unwrap();
        assert!(bare.arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_success_modes() {
        assert!(SuccessMode::Majority.evaluate(3, 2, 0));
        assert!(!SuccessMode::Majority.evaluate(1, 1, 0));
        assert!(SuccessMode::Majority.evaluate(0, 0, 4));
        assert!(!SuccessMode::Strict.evaluate(3, 1, 0));
        assert!(!SuccessMode::Strict.evaluate(3, 0, 1));
        assert!(SuccessMode::Strict.evaluate(3, 0, 0));
    }

    #[test]
    fn test_options_defaults() {
        let opts: WorkflowOptions = serde_yaml::from_str("{}").unwrap();
        assert_eq!(opts.max_attempts, 3);
        assert_eq!(opts.backoff(), Duration::from_millis(250));
        assert_eq!(opts.max_parallel, 8);
        assert!(opts.deadline().is_none());
        assert_eq!(opts.success_mode, SuccessMode::Majority);
    }
}
