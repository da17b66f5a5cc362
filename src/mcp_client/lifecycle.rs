//! Server process lifecycle management.
//!
//! Spawns server child processes with piped stdio, detects servers that die
//! during startup, keeps a bounded tail of their stderr for diagnostics, and
//! shuts them down with SIGTERM → SIGKILL escalation.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::ServerDescriptor;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained per server.
const STDERR_TAIL_LINES: usize = 50;

/// Maximum stderr characters quoted in an error message.
const STDERR_MAX_CHARS: usize = 2000;

/// How long to wait for the stderr drain after the process exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

/// Background drain of a child's stderr.
///
/// Draining keeps the child from blocking on a full pipe; the last lines are
/// kept for error reports.
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
}

impl StderrTail {
    fn start(server: &str, stderr: Option<ChildStderr>) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let drain = stderr.map(|stderr| {
            let lines = Arc::clone(&lines);
            let server = server.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!(server = %server, line = %line, "server stderr");
                    if let Ok(mut tail) = lines.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        });
        Self { lines, drain }
    }

    /// Wait (briefly) for the drain to reach EOF. Only meaningful after exit.
    async fn settle(&mut self) {
        if let Some(handle) = self.drain.as_mut() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, handle).await;
            self.drain = None;
        }
    }

    fn snapshot(&self) -> String {
        let joined = match self.lines.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        };
        truncate_chars(joined.trim(), STDERR_MAX_CHARS)
    }
}

impl Drop for StderrTail {
    fn drop(&mut self) {
        if let Some(handle) = self.drain.take() {
            handle.abort();
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...(truncated)");
    out
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── ServerProcess ───────────────────────────────────────────────────────────

/// A running server child process. Owns the process, not the protocol.
pub struct ServerProcess {
    name: String,
    /// `None` once the process has been reaped.
    child: Option<Child>,
    stderr: StderrTail,
}

impl ServerProcess {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Check if the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Last captured stderr lines, truncated.
    pub fn stderr_tail(&self) -> String {
        self.stderr.snapshot()
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then SIGKILL and reap.
    ///
    /// Safe to call repeatedly; later calls are no-ops.
    pub async fn shutdown(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        match terminate_child(&mut child, grace).await {
            Ok(status) => {
                tracing::debug!(server = %self.name, status = %status, "server process exited");
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "failed to stop server process cleanly");
            }
        }
    }
}

/// Spawn a server process and wait out the startup grace period.
///
/// Returns the process handle plus its stdin/stdout for the transport. A
/// process that exits before `startup_grace` elapses is reported as a
/// `ConnectionError` carrying its exit status and stderr.
pub async fn spawn_process(
    descriptor: &ServerDescriptor,
    startup_grace: Duration,
) -> Result<(ServerProcess, ChildStdin, ChildStdout), McpError> {
    let name = descriptor.name.as_str();

    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);

    // Merged over the inherited environment
    for (key, value) in &descriptor.env {
        cmd.env(key, value);
    }

    if let Some(dir) = descriptor.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::ConnectionError {
        name: name.to_string(),
        reason: format!("spawn '{}' failed: {e}", descriptor.command),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| McpError::ConnectionError {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or_else(|| McpError::ConnectionError {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let mut stderr = StderrTail::start(name, child.stderr.take());

    let early_exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(startup_grace) => None,
    };

    if let Some(status) = early_exit {
        stderr.settle().await;
        let detail = stderr.snapshot();
        if !detail.is_empty() {
            tracing::warn!(server = name, stderr = %detail, "server stderr captured on early exit");
        }
        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown exit status ({e})"),
        };
        return Err(McpError::ConnectionError {
            name: name.to_string(),
            reason: format!(
                "process exited during startup ({status}){}",
                format_stderr_suffix(&detail)
            ),
        });
    }

    tracing::debug!(server = name, pid = ?child.id(), "server process started");

    Ok((
        ServerProcess {
            name: name.to_string(),
            child: Some(child),
            stderr,
        },
        stdin,
        stdout,
    ))
}

// ─── Termination ─────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn terminate_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped by tokio
        return child.wait().await;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(std::io::Error::other(e));
    }

    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        return result;
    }

    child.kill().await?;
    child.wait().await
}

#[cfg(not(unix))]
async fn terminate_child(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    // No SIGTERM equivalent; terminate immediately
    child.kill().await?;
    child.wait().await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
