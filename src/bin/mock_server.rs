//! Mock aggregator for testing
//!
//! Speaks just enough of the tool protocol over HTTP to let the harness run
//! scenarios end to end without a real aggregator. It reads the generated
//! config tree:
//!
//! - `config.yaml`: `aggregator.host` and `aggregator.port`
//! - `mcpservers/*.yaml`: tools exposed as `x_<server>_<tool>`; each tool may
//!   set `response` (string with `{{arg}}` placeholders, or JSON), `error`,
//!   `structured` and `delay_ms`
//! - `workflows/*.yaml`: exposed as `workflow_<name>`
//!
//! Usage: mock_server serve --headless --config-path <dir> [--debug]
//!        [--register-delay-ms N] [--page-size N] [--sse]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Parser)]
#[command(name = "mock_server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Serve {
        #[arg(long)]
        headless: bool,
        #[arg(long)]
        config_path: PathBuf,
        #[arg(long)]
        debug: bool,
        /// Hide provider tools for this long after startup
        #[arg(long, default_value_t = 0)]
        register_delay_ms: u64,
        /// Paginate tools/list
        #[arg(long)]
        page_size: Option<usize>,
        /// Answer with server-sent events instead of plain JSON
        #[arg(long)]
        sse: bool,
    },
}

#[derive(Debug, Clone)]
struct MockTool {
    name: String,
    description: String,
    response: Value,
    error: bool,
    structured: bool,
    /// Time spent before answering a call
    delay: Duration,
    /// Provider tools appear only after the registration delay
    delayed: bool,
}

struct MockState {
    tools: Vec<MockTool>,
    ready_at: Instant,
    page_size: Option<usize>,
    sse: bool,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct ServerFile {
    name: String,
    #[serde(default)]
    tools: Vec<ToolFile>,
}

#[derive(Debug, Deserialize)]
struct ToolFile {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    response: Value,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    structured: bool,
    #[serde(default)]
    delay_ms: u64,
}

#[tokio::main]
async fn main() {
    let Cli {
        command:
            Command::Serve {
                headless: _,
                config_path,
                debug,
                register_delay_ms,
                page_size,
                sse,
            },
    } = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(if debug { "debug" } else { "info" })
        .with_target(false)
        .init();

    if let Err(e) = run(&config_path, register_delay_ms, page_size, sse).await {
        eprintln!("mock_server: {e}");
        std::process::exit(1);
    }
}

async fn run(
    config_path: &Path,
    register_delay_ms: u64,
    page_size: Option<usize>,
    sse: bool,
) -> Result<(), String> {
    let main: Value = read_yaml(&config_path.join("config.yaml"))?;
    let host = main["aggregator"]["host"].as_str().unwrap_or("127.0.0.1").to_string();
    let port = main["aggregator"]["port"]
        .as_u64()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or("config.yaml has no aggregator.port")?;

    let tools = load_tools(config_path)?;
    tracing::info!(tools = tools.len(), "Loaded tool definitions");

    let state = Arc::new(MockState {
        tools,
        ready_at: Instant::now() + Duration::from_millis(register_delay_ms),
        page_size: page_size.filter(|n| *n > 0),
        sse,
    });
    let app = Router::new()
        .route("/mcp", post(handle_rpc).delete(handle_delete))
        .with_state(state);

    let bind_host = if host == "localhost" { "127.0.0.1" } else { host.as_str() };
    let listener = tokio::net::TcpListener::bind((bind_host, port))
        .await
        .map_err(|e| format!("bind {}:{} failed: {}", bind_host, port, e))?;
    println!("mock aggregator listening on {}:{}", bind_host, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| e.to_string())?;
    println!("mock aggregator stopped");
    Ok(())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("read {}: {}", path.display(), e))?;
    serde_yaml::from_str(&content).map_err(|e| format!("parse {}: {}", path.display(), e))
}

fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("yaml"))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn load_tools(config_path: &Path) -> Result<Vec<MockTool>, String> {
    let mut tools = vec![MockTool {
        name: "core_ping".to_string(),
        description: "Liveness check".to_string(),
        response: json!("pong"),
        error: false,
        structured: false,
        delay: Duration::ZERO,
        delayed: false,
    }];

    for file in yaml_files(&config_path.join("mcpservers")) {
        let server: ServerFile = read_yaml(&file)?;
        for tool in server.tools {
            tools.push(MockTool {
                name: format!("x_{}_{}", server.name, tool.name),
                description: tool.description.unwrap_or_default(),
                response: tool.response,
                error: tool.error,
                structured: tool.structured,
                delay: Duration::from_millis(tool.delay_ms),
                delayed: true,
            });
        }
    }

    for file in yaml_files(&config_path.join("workflows")) {
        let workflow: Value = read_yaml(&file)?;
        let name = workflow["name"].as_str().unwrap_or_default().to_string();
        tools.push(MockTool {
            name: format!("workflow_{}", name),
            description: format!("Run workflow {}", name),
            response: json!({ "workflow": name, "status": "completed" }),
            error: false,
            structured: true,
            delay: Duration::ZERO,
            delayed: true,
        });
    }
    Ok(tools)
}

impl MockState {
    fn visible_tools(&self) -> Vec<&MockTool> {
        let registered = Instant::now() >= self.ready_at;
        self.tools.iter().filter(|t| registered || !t.delayed).collect()
    }

    fn list_tools(&self, params: &Value) -> Value {
        let visible = self.visible_tools();
        let start = params["cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = match self.page_size {
            Some(size) => (start + size).min(visible.len()),
            None => visible.len(),
        };
        let page: Vec<Value> = visible
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": { "type": "object" }
                })
            })
            .collect();

        let mut result = json!({ "tools": page });
        if end < visible.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }

    async fn call_tool(&self, params: &Value) -> Result<Value, (i64, String)> {
        let name = params["name"].as_str().unwrap_or_default();
        let args = params["arguments"].as_object().cloned().unwrap_or_default();
        let tool = self
            .visible_tools()
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| (-32602, format!("tool not found: {}", name)))?;

        if !tool.delay.is_zero() {
            tokio::time::sleep(tool.delay).await;
        }
        tracing::info!(tool = %name, args = %serde_json::Value::Object(args.clone()), "Tool called");

        let text = match &tool.response {
            Value::Null => format!("{} ok", tool.name),
            Value::String(s) => substitute(s, &args),
            other => substitute(&other.to_string(), &args),
        };
        let mut result = json!({
            "content": [{ "type": "text", "text": text }],
            "isError": tool.error,
        });
        if tool.structured && tool.response.is_object() {
            result["structuredContent"] = tool.response.clone();
        }
        Ok(result)
    }
}

fn substitute(template: &str, args: &Map<String, Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{{{}}}}}", key), &rendered);
    }
    out
}

async fn handle_rpc(State(state): State<Arc<MockState>>, body: Bytes) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return reply(&state, Value::Null, Err((-32700, format!("parse error: {}", e)))),
    };
    tracing::debug!(method = %request.method, "Request");

    let Some(id) = request.id else {
        return StatusCode::ACCEPTED.into_response();
    };

    let outcome = match request.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-03-26",
            "serverInfo": { "name": "mock-aggregator", "version": env!("CARGO_PKG_VERSION") },
            "capabilities": { "tools": {}, "resources": {}, "prompts": {} }
        })),
        "tools/list" => Ok(state.list_tools(&request.params)),
        "tools/call" => state.call_tool(&request.params).await,
        "resources/read" => {
            let uri = request.params["uri"].as_str().unwrap_or_default();
            if uri == "mock://tools" {
                let names: Vec<&str> = state.visible_tools().iter().map(|t| t.name.as_str()).collect();
                Ok(json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": "application/json",
                        "text": json!(names).to_string()
                    }]
                }))
            } else {
                Err((-32002, format!("resource not found: {}", uri)))
            }
        }
        "prompts/get" => {
            let name = request.params["name"].as_str().unwrap_or_default();
            Ok(json!({
                "description": format!("Prompt {}", name),
                "messages": [{ "role": "user", "content": { "type": "text", "text": format!("prompt {}", name) } }]
            }))
        }
        other => Err((-32601, format!("method not found: {}", other))),
    };

    let mut response = reply(&state, id, outcome);
    if request.method == "initialize" {
        response
            .headers_mut()
            .insert(SESSION_HEADER, HeaderValue::from_static("mock-session-1"));
    }
    response
}

async fn handle_delete() -> StatusCode {
    StatusCode::OK
}

fn reply(state: &MockState, id: Value, outcome: Result<Value, (i64, String)>) -> Response {
    let body = match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => {
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
        }
    };
    if state.sse {
        let event = format!("event: message\ndata: {}\n\n", body);
        ([(header::CONTENT_TYPE, "text/event-stream")], event).into_response()
    } else {
        axum::Json(body).into_response()
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
