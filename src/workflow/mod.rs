//! Workflow scheduling — dependency graphs over tool calls, executed in stages.
//!
//! A [`WorkflowDefinition`] is validated into a [`DependencyGraph`], layered
//! into an [`ExecutionPlan`], and run by the [`WorkflowCoordinator`] through
//! the [`ToolRouter`].

pub mod coordinator;
pub mod errors;
pub mod graph;
pub mod placeholder;
pub mod scheduler;
pub mod tool_router;
pub mod types;

pub use coordinator::WorkflowCoordinator;
pub use errors::WorkflowError;
pub use graph::{DependencyGraph, StepHandle};
pub use scheduler::ExecutionPlan;
pub use tool_router::{ServerStats, ToolInvocation, ToolRouter};
pub use types::{
    ServerUtilization, StepResult, SuccessMode, WorkflowDefinition, WorkflowOptions,
    WorkflowReport, WorkflowStep,
};
