//! JSON-RPC over stdio transport.
//!
//! Owns a backend child process and multiplexes requests over its stdio:
//! - Requests are written to stdin, one JSON object per line
//! - A reader task routes stdout responses to waiting callers by `id`
//! - Server-initiated `ping` requests are answered in place
//! - stderr is drained into the log and a short tail kept for diagnostics

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::config::{child_environment, SubprocessConfig};
use super::errors::McpError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time a child gets to exit after stdin is closed before it is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of stderr lines retained for error context.
const STDERR_TAIL_LINES: usize = 20;

/// Upper bound on the stderr context attached to an error message.
const STDERR_TAIL_MAX_CHARS: usize = 2000;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Requests ────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingState {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
}

type Pending = Arc<StdMutex<PendingState>>;

fn lock_pending(pending: &Pending) -> std::sync::MutexGuard<'_, PendingState> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a waiter when its request future is dropped before completion.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).waiters.remove(&self.id);
    }
}

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct StderrTail {
    lines: Arc<StdMutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_TAIL_MAX_CHARS {
            let mut cut = joined.len() - STDERR_TAIL_MAX_CHARS;
            while !joined.is_char_boundary(cut) {
                cut += 1;
            }
            joined = format!("...{}", &joined[cut..]);
        }
        joined
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Arc<Mutex<Option<ChildStdin>>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    stderr_tail: StderrTail,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Spawn the configured child process and start routing its output.
    ///
    /// The child gets a cleared environment rebuilt from
    /// [`child_environment`], and is killed if the transport is dropped.
    pub fn spawn(server_name: &str, config: &SubprocessConfig) -> Result<Self, McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env_clear()
            .envs(child_environment(&config.env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: format!("{}: {e}", config.command),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::debug!(
            server = server_name,
            command = %config.command,
            pid = ?child.id(),
            "spawned backend process"
        );

        Ok(Self::from_parts(server_name, child, stdin, stdout, stderr))
    }

    fn from_parts(
        server_name: &str,
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
    ) -> Self {
        let writer = Arc::new(Mutex::new(Some(stdin)));
        let pending: Pending = Arc::default();
        let stderr_tail = StderrTail::default();

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            stdout,
            Arc::clone(&writer),
            Arc::clone(&pending),
        ));
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(drain_stderr(
                server_name.to_string(),
                stderr,
                stderr_tail.clone(),
            ))
        });

        Self {
            server_name: server_name.to_string(),
            writer,
            child: Mutex::new(Some(child)),
            pending,
            stderr_tail,
            reader_task,
            stderr_task,
        }
    }

    /// Whether the child's stdout has closed or the transport was shut down.
    pub fn is_closed(&self) -> bool {
        lock_pending(&self.pending).closed
    }

    /// Last lines the child wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.snapshot()
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Concurrent requests are allowed; each waits on its own id. Dropping
    /// the returned future abandons the request without affecting others.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock_pending(&self.pending);
            if state.closed {
                return Err(self.closed_error());
            }
            state.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        rx.await.map_err(|_| self.closed_error())
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Close stdin, give the child a grace period to exit, then kill it.
    ///
    /// Idempotent; waiters still pending are failed.
    pub async fn shutdown(&self) {
        self.writer.lock().await.take();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "backend process exited");
                }
                _ => {
                    tracing::warn!(
                        server = %self.server_name,
                        "backend did not exit after stdin closed, killing"
                    );
                    let _ = child.kill().await;
                }
            }
        }

        fail_pending(&self.pending);
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        let stdin = writer.as_mut().ok_or_else(|| self.closed_error())?;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }

    fn closed_error(&self) -> McpError {
        let tail = self.stderr_tail();
        let reason = if tail.is_empty() {
            "server stdout closed (process may have exited)".to_string()
        } else {
            format!("server stdout closed (process may have exited) | stderr: {tail}")
        };
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Route stdout messages until EOF, then fail everything still waiting.
async fn read_loop(
    server: String,
    stdout: ChildStdout,
    writer: Arc<Mutex<Option<ChildStdin>>>,
    pending: Pending,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                    // Not JSON; some servers log to stdout.
                    tracing::trace!(server = %server, line = trimmed, "ignoring non-JSON stdout line");
                    continue;
                };
                match message {
                    Value::Array(batch) => {
                        for item in batch {
                            dispatch(&server, item, &writer, &pending).await;
                        }
                    }
                    single => dispatch(&server, single, &writer, &pending).await,
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read backend stdout");
                break;
            }
        }
    }
    tracing::debug!(server = %server, "backend stdout closed");
    fail_pending(&pending);
}

async fn dispatch(
    server: &str,
    message: Value,
    writer: &Arc<Mutex<Option<ChildStdin>>>,
    pending: &Pending,
) {
    if let Some(response) = JsonRpcResponse::from_message(&message) {
        let waiter = lock_pending(pending).waiters.remove(&response.id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(server, id = response.id, "response for unknown request id");
            }
        }
        return;
    }

    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned();
    match (method, id) {
        (Some(method), Some(id)) => {
            let reply = server_request_reply(method, id);
            if let Ok(mut line) = serde_json::to_string(&reply) {
                line.push('\n');
                let mut writer = writer.lock().await;
                if let Some(stdin) = writer.as_mut() {
                    if stdin.write_all(line.as_bytes()).await.is_ok() {
                        let _ = stdin.flush().await;
                    }
                }
            }
        }
        (Some(method), None) => {
            tracing::trace!(server, method, "backend notification");
        }
        _ => {
            tracing::debug!(server, "ignoring unrecognized message");
        }
    }
}

/// Reply to a request the backend sent us.
fn server_request_reply(method: &str, id: Value) -> Value {
    match method {
        "ping" => json!({"jsonrpc": "2.0", "id": id, "result": {}}),
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method not supported by client: {other}"),
            }
        }),
    }
}

fn fail_pending(pending: &Pending) {
    let mut state = lock_pending(pending);
    state.closed = true;
    // Dropping the senders wakes every waiter with a closed-channel error.
    state.waiters.clear();
}

async fn drain_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, line = %line, "backend stderr");
        tail.push(line);
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        let err = extract_result(resp).unwrap_err();
        match err {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            _ => panic!("expected ServerError"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: 1,
            result: None,
            error: None,
        };
        let err = extract_result(resp).unwrap_err();
        assert!(matches!(err, McpError::ServerError { .. }));
    }

    #[test]
    fn test_ping_reply_echoes_id() {
        let reply = server_request_reply("ping", json!("abc"));
        assert_eq!(reply["id"], "abc");
        assert_eq!(reply["result"], json!({}));

        let reply = server_request_reply("sampling/createMessage", json!(4));
        assert_eq!(reply["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(format!("line {i}"));
        }
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 0\n"));
        assert!(snapshot.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = SubprocessConfig {
            command: "/nonexistent/mcp-backend-binary".into(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        };
        let err = StdioTransport::spawn("ghost", &config).err().unwrap();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_fails_when_child_exits() {
        let config = SubprocessConfig {
            command: "sh".into(),
            args: vec!["-c".into(), "echo booting >&2; exit 0".into()],
            env: BTreeMap::new(),
            cwd: None,
        };
        let transport = StdioTransport::spawn("short-lived", &config).unwrap();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        transport.shutdown().await;
        assert!(transport.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_answers_server_ping_and_routes_response() {
        // Sends a ping, then answers our request once both lines are in.
        let script = r#"
echo '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'
read -r a
read -r b
both="$a
$b"
id=$(printf '%s\n' "$both" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
case "$both" in
  *'"result":{}'*) echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"pong\":true}}" ;;
  *) echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"pong\":false}}" ;;
esac
read -r _
"#;
        let config = SubprocessConfig {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            cwd: None,
        };
        let transport = StdioTransport::spawn("pinger", &config).unwrap();
        let resp = transport.request("tools/list", None).await.unwrap();
        assert_eq!(extract_result(resp).unwrap()["pong"], true);
        transport.shutdown().await;
        assert!(transport.is_closed());
    }
}
