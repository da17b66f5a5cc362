//! Workflow coordinator — runs an execution plan stage by stage.
//!
//! Steps in a stage run concurrently (bounded by `max_parallel`); the next
//! stage starts only after every step of the current one has finished. Each
//! step resolves its placeholders against the run's result map, retries
//! retriable failures with a fixed backoff, and records exactly one
//! [`StepResult`]. A failed critical step halts the run: later stages are
//! skipped.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::errors::WorkflowError;
use super::graph::DependencyGraph;
use super::placeholder;
use super::scheduler::ExecutionPlan;
use super::tool_router::ToolRouter;
use super::types::{
    ServerUtilization, StepResult, WorkflowDefinition, WorkflowOptions, WorkflowReport,
    WorkflowStep,
};
use crate::events::{EventSink, TracingSink, WorkflowEvent};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::ToolOrigin;

/// Per-run context shared by the steps of that run.
struct Run {
    id: String,
    deadline: Option<tokio::time::Instant>,
}

impl Run {
    fn expired(&self) -> bool {
        self.deadline
            .is_some_and(|d| tokio::time::Instant::now() >= d)
    }

    /// Await `fut`, giving up at the deadline.
    async fn bounded<F: Future>(&self, fut: F) -> Option<F::Output> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
            None => Some(fut.await),
        }
    }
}

pub struct WorkflowCoordinator {
    router: Arc<ToolRouter>,
    options: WorkflowOptions,
    events: Arc<dyn EventSink>,
}

impl WorkflowCoordinator {
    pub fn new(router: Arc<ToolRouter>, options: WorkflowOptions) -> Self {
        Self {
            router,
            options,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn options(&self) -> &WorkflowOptions {
        &self.options
    }

    /// Validate a workflow and lay it out into stages without running it.
    pub fn plan(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<(DependencyGraph, ExecutionPlan), WorkflowError> {
        let graph = DependencyGraph::build(&workflow.steps)?;
        let plan = ExecutionPlan::from_graph(&graph)?;
        Ok((graph, plan))
    }

    /// Run a workflow to completion.
    ///
    /// Configuration problems (cycles, unknown or duplicate ids) are returned
    /// as errors before any tool is called. Runtime failures are recorded in
    /// the report.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<WorkflowReport, WorkflowError> {
        let (graph, plan) = self.plan(workflow)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let run = Run {
            id: run_id.to_string(),
            deadline: self
                .options
                .deadline()
                .map(|d| tokio::time::Instant::now() + d),
        };

        tracing::info!(
            run_id = %run.id,
            workflow = %workflow.name,
            steps = graph.len(),
            stages = plan.len(),
            "workflow started"
        );

        let semaphore = Semaphore::new(self.options.max_parallel.max(1));
        let mut results: HashMap<String, StepResult> = HashMap::new();
        let mut ordered: Vec<StepResult> = Vec::with_capacity(graph.len());
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let mut skipped_steps = Vec::new();
        let mut halt_reason: Option<&'static str> = None;

        for (stage_index, stage) in plan.stages().iter().enumerate() {
            if halt_reason.is_none() && run.expired() {
                halt_reason = Some("workflow deadline exceeded");
                errors.push("workflow deadline exceeded".to_string());
            }
            if let Some(reason) = halt_reason {
                for &handle in stage {
                    let id = graph.id(handle).to_string();
                    self.events.emit(&WorkflowEvent::StepSkipped {
                        run_id: run.id.clone(),
                        step: id.clone(),
                        reason: reason.to_string(),
                    });
                    skipped_steps.push(id);
                }
                continue;
            }

            let ids: Vec<String> = stage.iter().map(|&h| graph.id(h).to_string()).collect();
            tracing::debug!(run_id = %run.id, stage = stage_index, steps = ?ids, "stage started");
            self.events.emit(&WorkflowEvent::StageStarted {
                run_id: run.id.clone(),
                stage: stage_index,
                steps: ids,
            });

            let mut dispatch = Vec::with_capacity(stage.len());
            for &handle in stage {
                let step = graph.step(handle);
                let resolved = placeholder::resolve(&step.arguments, &results);
                for text in resolved.unresolved {
                    self.events.emit(&WorkflowEvent::PlaceholderUnresolved {
                        run_id: run.id.clone(),
                        step: step.id.clone(),
                        placeholder: text.clone(),
                    });
                    warnings.push(format!(
                        "step '{}': unresolved placeholder {text} left as literal text",
                        step.id
                    ));
                }
                let critical = self.is_critical(step).await;
                dispatch.push(self.run_step(&run, &semaphore, stage_index, step, resolved.value, critical));
            }

            let outcomes = futures::future::join_all(dispatch).await;

            let mut succeeded = 0;
            let mut failed = 0;
            for (result, error) in outcomes {
                match error {
                    None => succeeded += 1,
                    Some(error) => {
                        failed += 1;
                        errors.push(error.to_string());
                        if result.critical && halt_reason.is_none() {
                            tracing::warn!(
                                run_id = %run.id,
                                step = %result.step_id,
                                "critical step failed, halting workflow"
                            );
                            halt_reason = Some("halted after critical step failure");
                        }
                    }
                }
                results.insert(result.step_id.clone(), result.clone());
                ordered.push(result);
            }

            self.events.emit(&WorkflowEvent::StageCompleted {
                run_id: run.id.clone(),
                stage: stage_index,
                succeeded,
                failed,
            });
        }

        let halted = halt_reason.is_some();

        let completed = ordered.iter().filter(|r| r.success).count();
        let failed = ordered.len() - completed;
        let skipped = skipped_steps.len();
        let success = self.options.success_mode.evaluate(completed, failed, skipped);
        let total_time_ms = clock.elapsed().as_millis() as u64;

        let report = WorkflowReport {
            run_id,
            workflow: workflow.name.clone(),
            started_at,
            total_steps: graph.len(),
            completed,
            failed,
            skipped,
            skipped_steps,
            server_utilization: utilization(&ordered),
            total_time_ms,
            results: ordered,
            errors,
            warnings,
            halted,
            success,
        };

        self.events.emit(&WorkflowEvent::WorkflowCompleted {
            run_id: run.id.clone(),
            workflow: workflow.name.clone(),
            success,
            completed,
            failed,
            skipped,
            elapsed_ms: total_time_ms,
        });
        Ok(report)
    }

    /// Explicit override first; otherwise only remote tools are best-effort.
    async fn is_critical(&self, step: &WorkflowStep) -> bool {
        if let Some(critical) = step.critical {
            return critical;
        }
        let origin = self
            .router
            .tool_origin(&step.tool, step.server.as_deref())
            .await;
        origin != Some(ToolOrigin::Remote)
    }

    async fn run_step(
        &self,
        run: &Run,
        semaphore: &Semaphore,
        stage: usize,
        step: &WorkflowStep,
        arguments: Value,
        critical: bool,
    ) -> (StepResult, Option<WorkflowError>) {
        let _permit = semaphore.acquire().await.ok();

        let max_attempts = step
            .max_attempts
            .unwrap_or(self.options.max_attempts)
            .max(1);
        let planned_server = self.router.route(&step.tool, step.server.as_deref()).await;
        let started = Instant::now();
        let mut attempt = 0;

        let failure = loop {
            attempt += 1;
            self.events.emit(&WorkflowEvent::StepStarted {
                run_id: run.id.clone(),
                step: step.id.clone(),
                tool: step.tool.clone(),
                attempt,
            });

            let call = self.router.invoke(
                &step.tool,
                arguments.clone(),
                step.server.as_deref(),
                step.timeout(),
            );
            let outcome = run.bounded(call).await.unwrap_or_else(|| {
                Err(McpError::Cancelled {
                    tool: step.tool.clone(),
                    reason: "workflow deadline exceeded".into(),
                })
            });

            let error = match outcome {
                Ok(invocation) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    self.events.emit(&WorkflowEvent::StepSucceeded {
                        run_id: run.id.clone(),
                        step: step.id.clone(),
                        server: invocation.server.clone(),
                        attempt,
                        elapsed_ms,
                    });
                    let result = StepResult {
                        step_id: step.id.clone(),
                        tool: step.tool.clone(),
                        server: Some(invocation.server),
                        success: true,
                        payload: Some(invocation.result),
                        error: None,
                        attempt,
                        critical,
                        stage,
                        execution_time_ms: elapsed_ms,
                    };
                    return (result, None);
                }
                Err(e) => e,
            };

            if !error.is_retriable() || attempt >= max_attempts || run.expired() {
                break error;
            }

            self.events.emit(&WorkflowEvent::StepRetrying {
                run_id: run.id.clone(),
                step: step.id.clone(),
                attempt,
                error: error.to_string(),
                backoff_ms: self.options.backoff_ms,
            });
            if run
                .bounded(tokio::time::sleep(self.options.backoff()))
                .await
                .is_none()
            {
                break McpError::Cancelled {
                    tool: step.tool.clone(),
                    reason: format!("workflow deadline exceeded while retrying ({error})"),
                };
            }
        };

        self.events.emit(&WorkflowEvent::StepFailed {
            run_id: run.id.clone(),
            step: step.id.clone(),
            attempt,
            critical,
            error: failure.to_string(),
        });

        let result = StepResult {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            server: planned_server,
            success: false,
            payload: None,
            error: Some(failure.to_string()),
            attempt,
            critical,
            stage,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };
        (
            result,
            Some(WorkflowError::StepExecution {
                step: step.id.clone(),
                source: failure,
            }),
        )
    }
}

fn utilization(results: &[StepResult]) -> BTreeMap<String, ServerUtilization> {
    let mut usage: BTreeMap<String, ServerUtilization> = BTreeMap::new();
    for result in results {
        if let Some(server) = &result.server {
            let entry = usage.entry(server.clone()).or_default();
            entry.steps += 1;
            if result.success {
                entry.successes += 1;
            }
            entry.busy_ms += result.execution_time_ms;
        }
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use crate::mcp_client::manager::SessionManager;
    use crate::mcp_client::registry::CollisionPolicy;
    use crate::mcp_client::session::ToolSession as _;
    use crate::mcp_client::types::SessionOptions;
    use crate::testing::{descriptor, CallRecord, FakeConnector, FakeSession};
    use crate::workflow::types::SuccessMode;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        coordinator: WorkflowCoordinator,
    }

    async fn harness(sessions: Vec<(Arc<FakeSession>, bool)>, options: WorkflowOptions) -> Harness {
        let connector = FakeConnector::new();
        let mut descriptors = Vec::new();
        for (session, remote) in sessions {
            let mut d = descriptor(session.server_name());
            d.remote = remote;
            descriptors.push(d);
            connector.insert(session);
        }
        let manager = SessionManager::new(SessionOptions::default(), CollisionPolicy::LastWins)
            .with_connector(Arc::new(connector));
        manager.initialize_all(&descriptors).await;
        let router = Arc::new(ToolRouter::new(Arc::new(manager)));
        Harness {
            coordinator: WorkflowCoordinator::new(router, options),
        }
    }

    fn fast() -> WorkflowOptions {
        WorkflowOptions {
            backoff_ms: 5,
            ..WorkflowOptions::default()
        }
    }

    fn overlaps(a: &CallRecord, b: &CallRecord) -> bool {
        a.started < b.finished && b.started < a.finished
    }

    #[tokio::test]
    async fn test_empty_workflow_is_successful() {
        let h = harness(vec![], fast()).await;
        let report = h
            .coordinator
            .execute(&WorkflowDefinition::new("empty", vec![]))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.total_steps, 0);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_call() {
        let s = Arc::new(FakeSession::new("s").with_tool("t"));
        let h = harness(vec![(s.clone(), false)], fast()).await;
        let wf = WorkflowDefinition::new(
            "cyclic",
            vec![
                WorkflowStep::new("a", "t").after(&["b"]),
                WorkflowStep::new("b", "t").after(&["a"]),
                WorkflowStep::new("free", "t"),
            ],
        );

        let err = h.coordinator.execute(&wf).await.unwrap_err();
        assert!(matches!(err, WorkflowError::CyclicDependency { .. }));
        assert_eq!(s.call_count(), 0);
    }

    #[tokio::test]
    async fn test_results_flow_into_later_stages() {
        let web = Arc::new(FakeSession::new("web").with_tool("fetch_url").with_handler(
            |_, _, _| Ok(json!({"content": "hello", "title": "Greeting"})),
        ));
        let store = Arc::new(FakeSession::new("store").with_tool("write_record"));
        let chat = Arc::new(FakeSession::new("chat").with_tool("send_message"));
        let h = harness(
            vec![(web, false), (store.clone(), false), (chat.clone(), false)],
            fast(),
        )
        .await;

        let wf = WorkflowDefinition::new(
            "fetch-store-notify",
            vec![
                WorkflowStep::new("fetch", "fetch_url"),
                WorkflowStep::new("store", "write_record")
                    .with_arguments(json!({"body": "${fetch.content}"})),
                WorkflowStep::new("notify", "send_message")
                    .with_arguments(json!({"text": "${fetch.title}", "all": "${fetch}"})),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(report.success);
        assert_eq!(report.completed, 3);
        assert_eq!(report.result("fetch").unwrap().stage, 0);
        assert_eq!(report.result("store").unwrap().stage, 1);
        assert_eq!(report.result("notify").unwrap().stage, 1);
        assert_eq!(store.calls()[0].arguments, json!({"body": "hello"}));
        assert_eq!(chat.calls()[0].arguments["text"], "Greeting");
        assert_eq!(chat.calls()[0].arguments["all"]["content"], "hello");
        assert!(report.warnings.is_empty());
        assert_eq!(report.server_utilization["web"].steps, 1);
    }

    #[tokio::test]
    async fn test_same_stage_steps_run_concurrently() {
        let delay = Duration::from_millis(80);
        let a = Arc::new(FakeSession::new("a").with_tool("slow_a").with_delay(delay));
        let b = Arc::new(FakeSession::new("b").with_tool("slow_b").with_delay(delay));
        let h = harness(vec![(a.clone(), false), (b.clone(), false)], fast()).await;

        let wf = WorkflowDefinition::new(
            "parallel",
            vec![WorkflowStep::new("x", "slow_a"), WorkflowStep::new("y", "slow_b")],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(report.success);
        assert!(overlaps(&a.calls()[0], &b.calls()[0]));
    }

    #[tokio::test]
    async fn test_same_server_calls_never_overlap() {
        let s = Arc::new(
            FakeSession::new("single")
                .with_tool("work")
                .with_delay(Duration::from_millis(20)),
        );
        let h = harness(vec![(s.clone(), false)], fast()).await;

        let steps = (0..4).map(|i| WorkflowStep::new(&format!("w{i}"), "work")).collect();
        let report = h
            .coordinator
            .execute(&WorkflowDefinition::new("serial", steps))
            .await
            .unwrap();

        assert_eq!(report.completed, 4);
        assert_eq!(s.call_count(), 4);
        assert!(!s.overlapped());
    }

    #[tokio::test]
    async fn test_retry_until_third_attempt_succeeds() {
        let s = Arc::new(FakeSession::new("s").with_tool("flaky").with_handler(
            |tool, _, attempt| {
                if attempt < 3 {
                    Err(McpError::ToolError {
                        tool: tool.to_string(),
                        message: format!("transient failure {attempt}"),
                    })
                } else {
                    Ok(json!({"ok": true}))
                }
            },
        ));
        let h = harness(vec![(s.clone(), false)], fast()).await;

        let wf = WorkflowDefinition::new(
            "retry",
            vec![WorkflowStep::new("only", "flaky").with_max_attempts(3)],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert!(result.success);
        assert_eq!(result.attempt, 3);
        assert_eq!(s.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_stops_immediately() {
        let s = Arc::new(FakeSession::new("s").with_tool_schema(
            "needs_path",
            json!({"type": "object", "required": ["path"]}),
        ));
        let h = harness(vec![(s.clone(), false)], fast()).await;

        let wf = WorkflowDefinition::new("bad-args", vec![WorkflowStep::new("x", "needs_path")]);
        let report = h.coordinator.execute(&wf).await.unwrap();

        let result = &report.results[0];
        assert!(!result.success);
        assert_eq!(result.attempt, 1);
        assert!(result.error.as_deref().unwrap().contains("missing required field"));
    }

    #[tokio::test]
    async fn test_critical_and_best_effort_failures() {
        let fail = |tool: &str, _: &Value, _: u32| -> Result<Value, McpError> {
            Err(McpError::ToolError {
                tool: tool.to_string(),
                message: "down".into(),
            })
        };
        let local = Arc::new(
            FakeSession::new("local")
                .with_tool("ok_1")
                .with_tool("ok_2")
                .with_tool("ok_3")
                .with_handler(|tool, _, _| {
                    if tool == "local_fail" {
                        Err(McpError::ToolError {
                            tool: tool.to_string(),
                            message: "disk full".into(),
                        })
                    } else {
                        Ok(json!({}))
                    }
                })
                .with_tool("local_fail"),
        );
        let remote = Arc::new(FakeSession::new("remote").with_tool("remote_fail").with_handler(fail));
        let h = harness(vec![(local, false), (remote, true)], fast()).await;

        let wf = WorkflowDefinition::new(
            "mixed",
            vec![
                WorkflowStep::new("a", "ok_1"),
                WorkflowStep::new("b", "ok_2"),
                WorkflowStep::new("c", "ok_3"),
                WorkflowStep::new("critical", "local_fail"),
                WorkflowStep::new("best_effort", "remote_fail"),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert_eq!(report.failed, 2);
        assert_eq!(report.completed, 3);
        assert!(report.result("critical").unwrap().critical);
        assert!(!report.result("best_effort").unwrap().critical);
        assert!(report.halted);
        assert_eq!(report.skipped, 0);
        assert!(report.success, "3 completed > 2 failed under the majority rule");
    }

    #[tokio::test]
    async fn test_critical_failure_skips_later_stages() {
        let s = Arc::new(
            FakeSession::new("s")
                .with_tool("explode")
                .with_tool("after")
                .with_handler(|tool, _, _| {
                    if tool == "explode" {
                        Err(McpError::ToolError {
                            tool: tool.to_string(),
                            message: "no".into(),
                        })
                    } else {
                        Ok(json!({}))
                    }
                }),
        );
        let options = WorkflowOptions {
            max_attempts: 1,
            success_mode: SuccessMode::Strict,
            ..fast()
        };
        let h = harness(vec![(s.clone(), false)], options).await;

        let wf = WorkflowDefinition::new(
            "halts",
            vec![
                WorkflowStep::new("first", "explode"),
                WorkflowStep::new("second", "after").after(&["first"]),
                WorkflowStep::new("third", "after").after(&["second"]),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(report.halted);
        assert_eq!(report.skipped_steps, vec!["second", "third"]);
        assert_eq!(s.call_count(), 1);
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_best_effort_failure_leaves_placeholder_literal() {
        let remote = Arc::new(FakeSession::new("remote").with_tool("lookup").with_handler(
            |tool, _, _| {
                Err(McpError::ToolError {
                    tool: tool.to_string(),
                    message: "offline".into(),
                })
            },
        ));
        let local = Arc::new(FakeSession::new("local").with_tool("record"));
        let (sink, mut rx) = ChannelSink::new();
        let mut h = harness(vec![(remote, true), (local.clone(), false)], fast()).await;
        h.coordinator = h.coordinator.with_events(Arc::new(sink));

        let wf = WorkflowDefinition::new(
            "degrade",
            vec![
                WorkflowStep::new("lookup", "lookup").with_max_attempts(1),
                WorkflowStep::new("record", "record")
                    .with_arguments(json!({"value": "${lookup.answer}"})),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(!report.halted);
        assert_eq!(report.completed, 1);
        assert_eq!(local.calls()[0].arguments["value"], "${lookup.answer}");
        assert_eq!(report.warnings.len(), 1);

        let mut saw_warning = false;
        while let Ok(event) = rx.try_recv() {
            saw_warning |= event.kind() == "placeholder_unresolved";
        }
        assert!(saw_warning);
    }

    #[tokio::test]
    async fn test_placeholder_to_missing_step_stays_literal() {
        let s = Arc::new(FakeSession::new("s").with_tool("record"));
        let (sink, mut rx) = ChannelSink::new();
        let mut h = harness(vec![(s.clone(), false)], fast()).await;
        h.coordinator = h.coordinator.with_events(Arc::new(sink));

        let wf = WorkflowDefinition::new(
            "dangling",
            vec![WorkflowStep::new("a", "record")
                .with_arguments(json!({"x": "${stepA.result}", "n": 1}))],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(report.success);
        assert_eq!(report.completed, 1);
        assert_eq!(s.calls()[0].arguments, json!({"x": "${stepA.result}", "n": 1}));
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("${stepA.result}"));

        let mut unresolved = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::PlaceholderUnresolved { placeholder, .. } = event {
                unresolved.push(placeholder);
            }
        }
        assert_eq!(unresolved, vec!["${stepA.result}"]);
    }

    #[tokio::test]
    async fn test_server_hint_pins_step_to_provider() {
        let primary = Arc::new(FakeSession::new("primary").with_tool("search"));
        let mirror = Arc::new(FakeSession::new("mirror").with_tool("search"));
        let h = harness(vec![(primary.clone(), false), (mirror.clone(), false)], fast()).await;

        let wf = WorkflowDefinition::new(
            "pinned",
            vec![
                WorkflowStep::new("default", "search"),
                WorkflowStep::new("pinned", "search").on_server("primary"),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        assert!(report.success);
        assert_eq!(report.result("default").unwrap().server.as_deref(), Some("mirror"));
        assert_eq!(report.result("pinned").unwrap().server.as_deref(), Some("primary"));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(primary.calls()[0].tool, "search");
        assert_eq!(report.server_utilization["mirror"].successes, 1);
    }

    #[tokio::test]
    async fn test_deadline_cancels_in_flight_and_skips_rest() {
        let s = Arc::new(
            FakeSession::new("s")
                .with_tool("slow")
                .with_tool("next")
                .with_delay(Duration::from_millis(300)),
        );
        let options = WorkflowOptions {
            deadline_ms: Some(50),
            ..fast()
        };
        let h = harness(vec![(s.clone(), false)], options).await;

        let wf = WorkflowDefinition::new(
            "late",
            vec![
                WorkflowStep::new("slow", "slow"),
                WorkflowStep::new("next", "next").after(&["slow"]),
            ],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();

        let slow = report.result("slow").unwrap();
        assert!(!slow.success);
        assert!(slow.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(report.skipped_steps, vec!["next"]);
        assert!(report.halted);
    }

    #[tokio::test]
    async fn test_step_timeout_is_retried_then_reported() {
        let s = Arc::new(
            FakeSession::new("s")
                .with_tool("sluggish")
                .with_delay(Duration::from_millis(200)),
        );
        let h = harness(vec![(s.clone(), false)], fast()).await;
        let wf = WorkflowDefinition::new(
            "timeouts",
            vec![WorkflowStep::new("x", "sluggish")
                .with_timeout_ms(10)
                .with_max_attempts(2)
                .critical(false)],
        );
        let report = h.coordinator.execute(&wf).await.unwrap();
        let result = &report.results[0];
        assert!(!result.success);
        assert_eq!(result.attempt, 2);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
        assert!(!report.halted);
        assert!(s.is_connected());
    }
}
