//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! One exchange (write request, read until the correlated response) holds the
//! channel lock for its whole duration, so a transport never has two requests
//! outstanding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Both pipe ends, locked together.
struct Channel {
    writer: BoxedWriter,
    reader: BoxedReader,
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    channel: Mutex<Channel>,
    /// Per-connection request id counter, starts at 1.
    next_id: AtomicU64,
    /// Set once the pipes hit EOF or a write fails.
    closed: AtomicBool,
}

impl StdioTransport {
    /// Create a new transport from any writer/reader pair (child stdin/stdout
    /// in production, in-memory duplex pipes in tests).
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        Self {
            server_name: server_name.to_string(),
            channel: Mutex::new(Channel {
                writer: Box::new(writer),
                reader: Box::new(BufReader::new(reader)),
            }),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// The id the next request will carry.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Whether the pipes have been observed closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not JSON-RPC responses (server log output) and responses
    /// for other ids (late replies to timed-out calls) are skipped. On timeout
    /// only the wait is cancelled; the process keeps running.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        let mut line = serde_json::to_string(&req).map_err(|e| McpError::ProtocolError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        line.push('\n');

        let exchange = async {
            let mut channel = self.channel.lock().await;
            self.write_line(&mut channel, &line).await?;
            self.read_response(&mut channel, id).await
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);

        let mut line =
            serde_json::to_string(&notification).map_err(|e| McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;
        line.push('\n');

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await
    }

    async fn write_line(&self, channel: &mut Channel, line: &str) -> Result<(), McpError> {
        let result = async {
            channel.writer.write_all(line.as_bytes()).await?;
            channel.writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            McpError::ProtocolError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            }
        })
    }

    async fn read_response(
        &self,
        channel: &mut Channel,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut line_buf = String::new();

        loop {
            line_buf.clear();
            let bytes_read = channel
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| McpError::ProtocolError {
                    server: self.server_name.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })?;

            if bytes_read == 0 {
                self.closed.store(true, Ordering::SeqCst);
                return Err(McpError::ProtocolError {
                    server: self.server_name.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                Ok(resp) => {
                    tracing::debug!(
                        server = %self.server_name,
                        expected = id,
                        got = ?resp.id,
                        "skipping uncorrelated message"
                    );
                }
                Err(_) => {
                    tracing::trace!(server = %self.server_name, line = trimmed, "skipping non-JSON-RPC line");
                }
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(server: &str, response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| McpError::ProtocolError {
        server: server.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
