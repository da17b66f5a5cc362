//! Observability events for server connections and workflow runs.
//!
//! The manager and the coordinator report progress through an [`EventSink`].
//! Sinks decide the transport: structured `tracing` output, an mpsc channel
//! for a subscriber, or nothing at all.

use serde::Serialize;
use tokio::sync::mpsc;

/// Something observable happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ServerConnected {
        server: String,
        tools: usize,
    },
    ServerConnectionFailed {
        server: String,
        error: String,
    },
    ServerDisconnected {
        server: String,
    },
    StageStarted {
        run_id: String,
        stage: usize,
        steps: Vec<String>,
    },
    StageCompleted {
        run_id: String,
        stage: usize,
        succeeded: usize,
        failed: usize,
    },
    StepStarted {
        run_id: String,
        step: String,
        tool: String,
        attempt: u32,
    },
    StepRetrying {
        run_id: String,
        step: String,
        attempt: u32,
        error: String,
        backoff_ms: u64,
    },
    StepSucceeded {
        run_id: String,
        step: String,
        server: String,
        attempt: u32,
        elapsed_ms: u64,
    },
    StepFailed {
        run_id: String,
        step: String,
        attempt: u32,
        critical: bool,
        error: String,
    },
    StepSkipped {
        run_id: String,
        step: String,
        reason: String,
    },
    PlaceholderUnresolved {
        run_id: String,
        step: String,
        placeholder: String,
    },
    WorkflowCompleted {
        run_id: String,
        workflow: String,
        success: bool,
        completed: usize,
        failed: usize,
        skipped: usize,
        elapsed_ms: u64,
    },
}

impl WorkflowEvent {
    /// Short machine-readable name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerConnected { .. } => "server_connected",
            Self::ServerConnectionFailed { .. } => "server_connection_failed",
            Self::ServerDisconnected { .. } => "server_disconnected",
            Self::StageStarted { .. } => "stage_started",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StepStarted { .. } => "step_started",
            Self::StepRetrying { .. } => "step_retrying",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::PlaceholderUnresolved { .. } => "placeholder_unresolved",
            Self::WorkflowCompleted { .. } => "workflow_completed",
        }
    }
}

/// Receives events as they happen.
///
/// `emit` is called from inside async tasks and must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WorkflowEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &WorkflowEvent) {}
}

/// Writes events as structured `tracing` records. The default sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::ServerConnectionFailed { server, error } => {
                tracing::warn!(server = %server, error = %error, "server connection failed");
            }
            WorkflowEvent::StepFailed {
                step,
                attempt,
                critical,
                error,
                ..
            } => {
                tracing::warn!(step = %step, attempt, critical, error = %error, "step failed");
            }
            WorkflowEvent::StepRetrying {
                step,
                attempt,
                error,
                backoff_ms,
                ..
            } => {
                tracing::info!(step = %step, attempt, backoff_ms, error = %error, "retrying step");
            }
            WorkflowEvent::PlaceholderUnresolved {
                step, placeholder, ..
            } => {
                tracing::warn!(step = %step, placeholder = %placeholder, "unresolved placeholder");
            }
            WorkflowEvent::WorkflowCompleted {
                run_id,
                workflow,
                success,
                completed,
                failed,
                skipped,
                elapsed_ms,
            } => {
                tracing::info!(
                    run_id = %run_id,
                    workflow = %workflow,
                    success,
                    completed,
                    failed,
                    skipped,
                    elapsed_ms,
                    "workflow completed"
                );
            }
            other => {
                tracing::debug!(event = other.kind(), detail = ?other, "workflow event");
            }
        }
    }
}

/// Forwards events to an unbounded channel.
///
/// A dropped receiver is not an error; events are then discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver a subscriber reads from.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: &WorkflowEvent) {
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_noop_sink() {
        let sink: Arc<dyn EventSink> = Arc::new(NoopSink);
        sink.emit(&WorkflowEvent::ServerDisconnected {
            server: "files".into(),
        });
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(&WorkflowEvent::ServerConnected {
            server: "a".into(),
            tools: 2,
        });
        sink.emit(&WorkflowEvent::ServerDisconnected { server: "a".into() });

        assert_eq!(rx.recv().await.unwrap().kind(), "server_connected");
        assert_eq!(rx.recv().await.unwrap().kind(), "server_disconnected");
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(&WorkflowEvent::ServerDisconnected { server: "a".into() });
    }

    #[test]
    fn test_serialized_tag_matches_kind() {
        let event = WorkflowEvent::StepSkipped {
            run_id: "r".into(),
            step: "notify".into(),
            reason: "halted".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["step"], "notify");
    }
}
