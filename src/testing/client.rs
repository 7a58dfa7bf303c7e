//! Protocol test client
//!
//! One client wraps one connection to one server instance. Two backends
//! share the same surface: the HTTP transport used against real instances,
//! and an in-memory scripted backend for exercising the executor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use crate::common::{Error, Result};

use super::protocol::{
    decode_body, CallToolResult, GetPromptResult, InitializeResult,
    JsonRpcRequest, ListToolsResult, ReadResourceResult, ToolInfo, CLIENT_NAME, PROTOCOL_VERSION,
    SESSION_HEADER,
};

/// Upper bound on pages followed during `tools/list`
const MAX_TOOL_PAGES: usize = 50;

/// Resolve a logical tool name against the advertised names
///
/// Exact match wins. Otherwise any advertised name ending in `_<name>` or
/// `-<name>` is a candidate (the aggregator prefixes tools with their
/// provider); among several candidates the shortest is chosen, ties broken
/// alphabetically so resolution is stable across runs.
pub fn resolve_tool_name(requested: &str, advertised: &[String]) -> Result<String> {
    if advertised.iter().any(|t| t == requested) {
        return Ok(requested.to_string());
    }

    let underscore = format!("_{}", requested);
    let dash = format!("-{}", requested);
    let mut candidates: Vec<&String> = advertised
        .iter()
        .filter(|t| t.ends_with(&underscore) || t.ends_with(&dash))
        .collect();

    candidates.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    if candidates.len() > 1 {
        tracing::debug!(
            tool = requested,
            ?candidates,
            "Ambiguous tool alias, choosing shortest"
        );
    }

    candidates
        .first()
        .map(|t| t.to_string())
        .ok_or_else(|| Error::ToolNotFound {
            name: requested.to_string(),
            available: advertised.to_vec(),
        })
}

/// Whether `advertised` satisfies an expected tool name (exact or alias)
pub fn tool_available(expected: &str, advertised: &[String]) -> bool {
    resolve_tool_name(expected, advertised).is_ok()
}

/// Client for one server instance
pub enum ToolClient {
    Http(HttpToolClient),
    Mock(MockToolClient),
}

impl ToolClient {
    /// HTTP client for an instance endpoint
    pub fn http(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        Ok(ToolClient::Http(HttpToolClient::new(endpoint, request_timeout)?))
    }

    /// Perform the protocol handshake
    pub async fn connect(&mut self) -> Result<()> {
        match self {
            ToolClient::Http(c) => c.connect().await,
            ToolClient::Mock(c) => c.connect(),
        }
    }

    /// Advertised tool names
    pub async fn list_tools(&mut self) -> Result<Vec<String>> {
        Ok(self
            .list_tools_with_schemas()
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    /// Advertised tools with descriptions and input schemas
    pub async fn list_tools_with_schemas(&mut self) -> Result<Vec<ToolInfo>> {
        match self {
            ToolClient::Http(c) => c.list_tools().await,
            ToolClient::Mock(c) => c.list_tools(),
        }
    }

    /// Resolve `name` and invoke it under the client's request timeout
    ///
    /// Returns the resolved name alongside the result.
    pub async fn call_tool(&mut self, name: &str, args: Value) -> Result<(String, CallToolResult)> {
        let limit = self.request_timeout();
        self.call_tool_within(name, args, limit).await
    }

    /// Resolve `name` and invoke it, allowing the call itself up to `limit`
    pub async fn call_tool_within(
        &mut self,
        name: &str,
        args: Value,
        limit: Duration,
    ) -> Result<(String, CallToolResult)> {
        let advertised = self.list_tools().await?;
        let resolved = resolve_tool_name(name, &advertised)?;
        let result = match self {
            ToolClient::Http(c) => c.call_tool(&resolved, args, limit).await?,
            ToolClient::Mock(c) => c.call_tool(&resolved, args).await?,
        };
        Ok((resolved, result))
    }

    /// Limit applied to control requests (handshake, listings)
    pub fn request_timeout(&self) -> Duration {
        match self {
            ToolClient::Http(c) => c.request_timeout,
            ToolClient::Mock(_) => Duration::from_secs(30),
        }
    }

    /// Read a resource by URI
    pub async fn read_resource(&mut self, uri: &str) -> Result<ReadResourceResult> {
        match self {
            ToolClient::Http(c) => c.read_resource(uri).await,
            ToolClient::Mock(_) => Err(Error::Protocol(
                "resources are not supported by the mock backend".to_string(),
            )),
        }
    }

    /// Render a prompt with arguments
    pub async fn get_prompt(&mut self, name: &str, args: Value) -> Result<GetPromptResult> {
        match self {
            ToolClient::Http(c) => c.get_prompt(name, args).await,
            ToolClient::Mock(_) => Err(Error::Protocol(
                "prompts are not supported by the mock backend".to_string(),
            )),
        }
    }

    /// Close the connection; calling it again is a no-op
    pub async fn close(&mut self) {
        match self {
            ToolClient::Http(c) => c.close().await,
            ToolClient::Mock(c) => c.connected = false,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            ToolClient::Http(c) => c.connected,
            ToolClient::Mock(c) => c.connected,
        }
    }
}

/// JSON-RPC over HTTP POST
pub struct HttpToolClient {
    endpoint: String,
    http: reqwest::Client,
    request_timeout: Duration,
    session_id: Option<String>,
    next_id: u64,
    connected: bool,
}

impl HttpToolClient {
    /// `request_timeout` bounds each control request; tool calls carry their own limit
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
            request_timeout,
            session_id: None,
            next_id: 1,
            connected: false,
        })
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let endpoint = self.endpoint.clone();
        let handshake_err = |reason: String| Error::Handshake {
            endpoint: endpoint.clone(),
            reason,
        };

        let result = self
            .request("initialize", Some(params), self.request_timeout)
            .await
            .map_err(|e| handshake_err(e.to_string()))?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| handshake_err(format!("invalid initialize result: {}", e)))?;
        tracing::debug!(
            endpoint = %self.endpoint,
            server = %init.server_info.name,
            protocol = %init.protocol_version,
            "Handshake complete"
        );

        self.notify("notifications/initialized")
            .await
            .map_err(|e| handshake_err(e.to_string()))?;
        self.connected = true;
        Ok(())
    }

    pub async fn list_tools(&mut self) -> Result<Vec<ToolInfo>> {
        self.ensure_connected()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, self.request_timeout).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| Error::Protocol(format!("invalid tools/list payload: {}", e)))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(&mut self, name: &str, args: Value, limit: Duration) -> Result<CallToolResult> {
        self.ensure_connected()?;
        let params = json!({ "name": name, "arguments": args });
        let result = self.request("tools/call", Some(params), limit).await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("invalid tools/call payload for {}: {}", name, e)))
    }

    pub async fn read_resource(&mut self, uri: &str) -> Result<ReadResourceResult> {
        self.ensure_connected()?;
        let result = self
            .request("resources/read", Some(json!({ "uri": uri })), self.request_timeout)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("invalid resources/read payload: {}", e)))
    }

    pub async fn get_prompt(&mut self, name: &str, args: Value) -> Result<GetPromptResult> {
        self.ensure_connected()?;
        let result = self
            .request(
                "prompts/get",
                Some(json!({ "name": name, "arguments": args })),
                self.request_timeout,
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Protocol(format!("invalid prompts/get payload: {}", e)))
    }

    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Some(session) = self.session_id.take() {
            // Servers without session support answer 405; either way we are done
            let _ = self
                .http
                .delete(&self.endpoint)
                .header(SESSION_HEADER, session)
                .timeout(self.request_timeout)
                .send()
                .await;
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn post(&self) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream");
        match &self.session_id {
            Some(session) => builder.header(SESSION_HEADER, session),
            None => builder,
        }
    }

    /// Send a request and return its `result`, giving up after `limit`
    async fn request(&mut self, method: &str, params: Option<Value>, limit: Duration) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let request = JsonRpcRequest::call(id, method, params);
        tracing::trace!(method, id, endpoint = %self.endpoint, "Request");

        let response = self.post().json(&request).timeout(limit).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(method, limit)
            } else {
                Error::Http(e)
            }
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.text().await?;

        let message = decode_body(&content_type, &body);
        if let Some(error) = message.as_ref().and_then(|m| m.error.as_ref()) {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message.clone(),
            });
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "HTTP {} for '{}': {}",
                status,
                method,
                crate::common::truncate(&body, 200)
            )));
        }

        message
            .and_then(|m| m.result)
            .ok_or_else(|| Error::Protocol(format!("missing result in '{}' response", method)))
    }

    async fn notify(&mut self, method: &str) -> Result<()> {
        let notification = JsonRpcRequest::notification(method);
        let response = self
            .post()
            .json(&notification)
            .timeout(self.request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Protocol(format!(
                "HTTP {} for notification '{}'",
                response.status(),
                method
            )));
        }
        Ok(())
    }
}

/// Scripted reply for the mock backend
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Tool returned an envelope (possibly with `is_error`)
    Result(CallToolResult),
    /// Call failed in transport
    Transport(String),
}

/// Recorded invocation on the mock backend
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub tool: String,
    pub args: Value,
}

/// In-memory backend with per-tool reply scripts
///
/// Each tool's script is consumed front to back; the last reply repeats.
#[derive(Debug, Default)]
pub struct MockToolClient {
    tools: Vec<String>,
    scripts: HashMap<String, VecDeque<MockReply>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    latency: Duration,
    connected: bool,
}

impl MockToolClient {
    pub fn new<S: Into<String>>(tools: impl IntoIterator<Item = S>) -> Self {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append replies for an advertised tool name
    #[must_use]
    pub fn with_replies(mut self, tool: &str, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.scripts
            .entry(tool.to_string())
            .or_default()
            .extend(replies);
        self
    }

    /// Delay every tool call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared handle on the call log
    pub fn call_log(&self) -> Arc<Mutex<Vec<MockCall>>> {
        Arc::clone(&self.calls)
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        Ok(self
            .tools
            .iter()
            .map(|name| ToolInfo {
                name: name.clone(),
                description: None,
                input_schema: json!({ "type": "object" }),
            })
            .collect())
    }

    async fn call_tool(&mut self, name: &str, args: Value) -> Result<CallToolResult> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                tool: name.to_string(),
                args,
            });
        }

        let reply = match self.scripts.get_mut(name) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        };
        match reply {
            Some(MockReply::Result(result)) => Ok(result),
            Some(MockReply::Transport(message)) => Err(Error::Protocol(message)),
            None => Ok(CallToolResult::text("ok")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_exact_and_prefixed() {
        let advertised = names(&["svc_ping", "other_pong"]);
        assert_eq!(resolve_tool_name("ping", &advertised).unwrap(), "svc_ping");
        assert_eq!(resolve_tool_name("other_pong", &advertised).unwrap(), "other_pong");

        let dashed = names(&["x-storage-create"]);
        assert_eq!(resolve_tool_name("create", &dashed).unwrap(), "x-storage-create");
    }

    #[test]
    fn test_resolve_ambiguous_is_deterministic() {
        let advertised = names(&["b_ping", "a_ping", "long_prefix_ping"]);
        for _ in 0..10 {
            assert_eq!(resolve_tool_name("ping", &advertised).unwrap(), "a_ping");
        }
        let mut reversed = advertised.clone();
        reversed.reverse();
        assert_eq!(resolve_tool_name("ping", &reversed).unwrap(), "a_ping");
    }

    #[test]
    fn test_resolve_requires_separator() {
        let advertised = names(&["xping", "ping_extra"]);
        match resolve_tool_name("ping", &advertised) {
            Err(Error::ToolNotFound { name, available }) => {
                assert_eq!(name, "ping");
                assert_eq!(available.len(), 2);
            }
            other => panic!("expected ToolNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_mock_client_scripts_and_log() {
        let mut client = ToolClient::Mock(
            MockToolClient::new(["svc_ping"]).with_replies(
                "svc_ping",
                [
                    MockReply::Transport("boom".to_string()),
                    MockReply::Result(CallToolResult::text("pong")),
                ],
            ),
        );
        let log = match &client {
            ToolClient::Mock(m) => m.call_log(),
            _ => unreachable!(),
        };

        assert!(matches!(client.list_tools().await, Err(Error::NotConnected)));
        client.connect().await.unwrap();

        assert!(client.call_tool("ping", json!({})).await.is_err());
        let (resolved, result) = client.call_tool("ping", json!({"n": 1})).await.unwrap();
        assert_eq!(resolved, "svc_ping");
        assert_eq!(result.joined_text(), "pong");
        // Last reply repeats
        let (_, again) = client.call_tool("ping", json!({})).await.unwrap();
        assert_eq!(again.joined_text(), "pong");

        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(log.lock().unwrap()[1].args, json!({"n": 1}));

        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_http_client_requires_connect() {
        let mut client = ToolClient::http("http://127.0.0.1:1/mcp", Duration::from_secs(1)).unwrap();
        assert!(matches!(client.list_tools().await, Err(Error::NotConnected)));
        // close before connect is fine
        client.close().await;
    }

    #[tokio::test]
    async fn test_http_connect_failure_is_handshake_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client =
            ToolClient::http(format!("http://127.0.0.1:{}/mcp", port), Duration::from_secs(2)).unwrap();
        assert!(matches!(client.connect().await, Err(Error::Handshake { .. })));
    }
}
