//! Dependency graph over workflow steps.
//!
//! Steps live in an arena and are addressed by [`StepHandle`] (their index in
//! definition order). Edges run producer → consumer and come from both
//! `depends_on` and placeholder references in the arguments. Only an unknown
//! `depends_on` entry is an error. A graph that
//! builds successfully is guaranteed acyclic.

use std::collections::HashMap;

use super::errors::WorkflowError;
use super::placeholder;
use super::types::WorkflowStep;

/// Index of a step in definition order.
pub type StepHandle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    steps: Vec<WorkflowStep>,
    index: HashMap<String, StepHandle>,
    successors: Vec<Vec<StepHandle>>,
    predecessors: Vec<Vec<StepHandle>>,
}

impl DependencyGraph {
    /// Validate ids, collect edges, and reject cycles.
    pub fn build(steps: &[WorkflowStep]) -> Result<Self, WorkflowError> {
        let mut index = HashMap::with_capacity(steps.len());
        for (handle, step) in steps.iter().enumerate() {
            validate_id(&step.id)?;
            if index.insert(step.id.clone(), handle).is_some() {
                return Err(WorkflowError::DuplicateStep {
                    id: step.id.clone(),
                });
            }
        }

        let mut graph = Self {
            steps: steps.to_vec(),
            index,
            successors: vec![Vec::new(); steps.len()],
            predecessors: vec![Vec::new(); steps.len()],
        };

        for (consumer, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let producer =
                    graph
                        .handle(dep)
                        .ok_or_else(|| WorkflowError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })?;
                graph.add_edge(producer, consumer);
            }

            // A placeholder naming no step gets no edge; it stays literal at
            // resolution time.
            for dep in placeholder::references(&step.arguments) {
                match graph.handle(&dep) {
                    Some(producer) => graph.add_edge(producer, consumer),
                    None => tracing::debug!(
                        step = %step.id,
                        reference = %dep,
                        "placeholder names no step in this workflow"
                    ),
                }
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            let cycle = cycle
                .into_iter()
                .map(|h| graph.steps[h].id.clone())
                .collect();
            return Err(WorkflowError::CyclicDependency { cycle });
        }

        tracing::debug!(
            steps = graph.len(),
            edges = graph.edge_count(),
            "dependency graph built"
        );
        Ok(graph)
    }

    fn add_edge(&mut self, from: StepHandle, to: StepHandle) {
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    /// White/gray/black depth-first walk; a successor that is still gray
    /// closes a cycle. Returns the cycle path ending where it started.
    fn find_cycle(&self) -> Option<Vec<StepHandle>> {
        let mut marks = vec![Mark::White; self.len()];
        let mut path: Vec<StepHandle> = Vec::new();

        for root in 0..self.len() {
            if marks[root] != Mark::White {
                continue;
            }
            marks[root] = Mark::Gray;
            path.push(root);
            let mut stack: Vec<(StepHandle, usize)> = vec![(root, 0)];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                let Some(&next) = self.successors[node].get(frame.1) else {
                    marks[node] = Mark::Black;
                    path.pop();
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match marks[next] {
                    Mark::Gray => {
                        let start = path.iter().position(|&h| h == next).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::White => {
                        marks[next] = Mark::Gray;
                        path.push(next);
                        stack.push((next, 0));
                    }
                    Mark::Black => {}
                }
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.successors.iter().map(Vec::len).sum()
    }

    pub fn handles(&self) -> std::ops::Range<StepHandle> {
        0..self.steps.len()
    }

    pub fn handle(&self, id: &str) -> Option<StepHandle> {
        self.index.get(id).copied()
    }

    pub fn step(&self, handle: StepHandle) -> &WorkflowStep {
        &self.steps[handle]
    }

    pub fn id(&self, handle: StepHandle) -> &str {
        &self.steps[handle].id
    }

    /// Steps that consume this step's output.
    pub fn successors(&self, handle: StepHandle) -> &[StepHandle] {
        &self.successors[handle]
    }

    /// Steps this step waits for.
    pub fn predecessors(&self, handle: StepHandle) -> &[StepHandle] {
        &self.predecessors[handle]
    }
}

fn validate_id(id: &str) -> Result<(), WorkflowError> {
    let reason = if id.trim().is_empty() {
        "must not be empty"
    } else if id.contains('.') {
        "must not contain '.'"
    } else {
        return Ok(());
    };
    Err(WorkflowError::InvalidStepId {
        id: id.to_string(),
        reason: reason.into(),
    })
}
