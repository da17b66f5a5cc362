//! Stage layering (Kahn's algorithm).
//!
//! Every step whose dependencies are all done forms the next stage. Within a
//! stage, handles are kept in definition order.

use super::errors::WorkflowError;
use super::graph::{DependencyGraph, StepHandle};

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    stages: Vec<Vec<StepHandle>>,
    /// `stage_of[handle]`.
    stage_of: Vec<usize>,
}

impl ExecutionPlan {
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self, WorkflowError> {
        let mut in_degree: Vec<usize> = graph
            .handles()
            .map(|h| graph.predecessors(h).len())
            .collect();
        let mut stage_of = vec![usize::MAX; graph.len()];
        let mut stages: Vec<Vec<StepHandle>> = Vec::new();

        let mut ready: Vec<StepHandle> = graph.handles().filter(|&h| in_degree[h] == 0).collect();

        while !ready.is_empty() {
            let mut next = Vec::new();
            for &handle in &ready {
                stage_of[handle] = stages.len();
                for &succ in graph.successors(handle) {
                    in_degree[succ] -= 1;
                    if in_degree[succ] == 0 {
                        next.push(succ);
                    }
                }
            }
            next.sort_unstable();
            stages.push(std::mem::replace(&mut ready, next));
        }

        let leftover: Vec<String> = graph
            .handles()
            .filter(|&h| stage_of[h] == usize::MAX)
            .map(|h| graph.id(h).to_string())
            .collect();
        if !leftover.is_empty() {
            return Err(WorkflowError::UnschedulableSteps { steps: leftover });
        }

        tracing::debug!(stages = stages.len(), steps = graph.len(), "execution plan ready");
        Ok(Self { stages, stage_of })
    }

    pub fn stages(&self) -> &[Vec<StepHandle>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_of(&self, handle: StepHandle) -> Option<usize> {
        self.stage_of.get(handle).copied()
    }

    /// Stages as step ids.
    pub fn stage_ids(&self, graph: &DependencyGraph) -> Vec<Vec<String>> {
        self.stages
            .iter()
            .map(|stage| stage.iter().map(|&h| graph.id(h).to_string()).collect())
            .collect()
    }

    /// Check that every step is in exactly one stage and runs strictly after
    /// everything it depends on.
    pub fn validate(&self, graph: &DependencyGraph) -> Result<(), WorkflowError> {
        let mut seen = vec![0usize; graph.len()];
        for (index, stage) in self.stages.iter().enumerate() {
            for &handle in stage {
                if handle >= graph.len() {
                    return Err(WorkflowError::InvalidPlan {
                        reason: format!("stage {index} holds unknown handle {handle}"),
                    });
                }
                seen[handle] += 1;
                if self.stage_of(handle) != Some(index) {
                    return Err(WorkflowError::InvalidPlan {
                        reason: format!("stage index of '{}' is inconsistent", graph.id(handle)),
                    });
                }
            }
        }

        for handle in graph.handles() {
            if seen[handle] != 1 {
                return Err(WorkflowError::InvalidPlan {
                    reason: format!(
                        "step '{}' appears in {} stages",
                        graph.id(handle),
                        seen[handle]
                    ),
                });
            }
            let stage = self.stage_of[handle];
            for &dep in graph.predecessors(handle) {
                if self.stage_of[dep] >= stage {
                    return Err(WorkflowError::InvalidPlan {
                        reason: format!(
                            "'{}' (stage {stage}) does not run after '{}' (stage {})",
                            graph.id(handle),
                            graph.id(dep),
                            self.stage_of[dep]
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}
