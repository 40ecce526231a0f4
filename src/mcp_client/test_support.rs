//! Fake MCP backends for transport tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use super::config::{BackendConfig, HttpConfig};

/// Line-oriented MCP server in `sh`: two pages of tools (`echo`, `fail`).
const SCRIPTED_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2025-03-26\",\"capabilities\":{\"tools\":{}},\"serverInfo\":{\"name\":\"scripted\",\"version\":\"0.1.0\"}}}" ;;
    *'"method":"tools/list"'*'"cursor":"page-2"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"fail\",\"inputSchema\":{\"type\":\"object\"}}]}}" ;;
    *'"method":"tools/list"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"Echo text\",\"inputSchema\":{\"type\":\"object\",\"properties\":{\"text\":{\"type\":\"string\"}}}}],\"nextCursor\":\"page-2\"}}" ;;
    *'"method":"tools/call"'*'"name":"echo"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"called\"}],\"isError\":false}}" ;;
    *'"method":"tools/call"'*'"name":"fail"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"boom\"}],\"isError\":true}}" ;;
    *)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32602,\"message\":\"unknown tool\"}}" ;;
  esac
done
"#;

/// Config for [`SCRIPTED_SERVER`].
pub fn scripted_stdio_config() -> BackendConfig {
    BackendConfig::subprocess("sh", &["-c", SCRIPTED_SERVER]).with_description("Scripted")
}

/// A process that reads stdin and never answers.
pub fn silent_stdio_config() -> BackendConfig {
    BackendConfig::subprocess("sh", &["-c", "cat >/dev/null"])
}

// ─── Streamable HTTP ─────────────────────────────────────────────────────────

const FAKE_SESSION: &str = "fake-session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBackendMode {
    /// Every response is a JSON body.
    Json,
    /// `tools/list` is answered over an SSE stream.
    Sse,
    /// `initialize` stalls for two seconds.
    SlowInitialize,
}

#[derive(Clone)]
struct FakeState {
    mode: HttpBackendMode,
    deletes: Arc<AtomicUsize>,
}

pub struct FakeHttpBackend {
    pub addr: SocketAddr,
    deletes: Arc<AtomicUsize>,
}

impl FakeHttpBackend {
    pub fn config(&self) -> HttpConfig {
        HttpConfig {
            server_url: format!("http://{}/mcp", self.addr),
            http_headers: Default::default(),
            http_timeout: 5,
            http_read_timeout: 5,
        }
    }

    /// Number of session DELETEs received.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

pub async fn spawn_http_backend(mode: HttpBackendMode) -> FakeHttpBackend {
    let deletes = Arc::new(AtomicUsize::new(0));
    let state = FakeState {
        mode,
        deletes: Arc::clone(&deletes),
    };
    let app = Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeHttpBackend { addr, deletes }
}

async fn handle_post(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };

    if method == "initialize" {
        if state.mode == HttpBackendMode::SlowInitialize {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        let result = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2025-03-26",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake-http", "version": "0.1.0"}
            }
        });
        return ([("mcp-session-id", FAKE_SESSION)], Json(result)).into_response();
    }

    let has_session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        == Some(FAKE_SESSION);
    if !has_session {
        return (StatusCode::BAD_REQUEST, "missing session").into_response();
    }

    match method.as_str() {
        "tools/list" => {
            let response = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [{
                    "name": "lookup",
                    "description": "Look something up",
                    "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}}}
                }]}
            });
            if state.mode == HttpBackendMode::Sse {
                let progress = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}});
                let body = format!(
                    ": keep-alive\r\n\r\nevent: message\r\ndata: {progress}\r\n\r\nevent: message\r\ndata: {response}\r\n\r\n"
                );
                ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            } else {
                Json(response).into_response()
            }
        }
        "tools/call" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [{"type": "text", "text": "remote result"}]}
        }))
        .into_response(),
        _ => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "method not found"}
        }))
        .into_response(),
    }
}

async fn handle_delete(State(state): State<FakeState>) -> StatusCode {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}
