//! Workflow error types.

use thiserror::Error;

use crate::mcp_client::errors::McpError;

/// Errors raised while validating, planning, or running a workflow.
///
/// Everything except `StepExecution` is detected before the first tool call.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    /// The dependency graph contains a cycle (listed start → … → start).
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A step depends on (or references) a step that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Two steps share an id.
    #[error("duplicate step id: '{id}'")]
    DuplicateStep { id: String },

    /// A step id is empty or cannot be used in placeholders.
    #[error("invalid step id '{id}': {reason}")]
    InvalidStepId { id: String, reason: String },

    /// Layering stalled with steps left over.
    #[error("steps could not be scheduled: {}", steps.join(", "))]
    UnschedulableSteps { steps: Vec<String> },

    /// A plan does not respect the dependency graph.
    #[error("invalid execution plan: {reason}")]
    InvalidPlan { reason: String },

    /// The workflow document could not be parsed.
    #[error("invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    /// A step failed at runtime after its retries.
    #[error("step '{step}' failed: {source}")]
    StepExecution { step: String, source: McpError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = WorkflowError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
    }

    #[test]
    fn test_step_execution_exposes_source() {
        use std::error::Error as _;
        let err = WorkflowError::StepExecution {
            step: "fetch".into(),
            source: McpError::ToolNotFound {
                name: "fetch_url".into(),
            },
        };
        assert!(err.source().is_some());
        assert_eq!(
            err.to_string(),
            "step 'fetch' failed: unknown tool: 'fetch_url'"
        );
    }
}
