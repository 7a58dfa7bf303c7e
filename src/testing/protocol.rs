//! Protocol message types
//!
//! JSON-RPC 2.0 envelopes plus the subset of the tool protocol the harness
//! speaks: initialize, tools/list, tools/call, resources/read, prompts/get.
//! Responses arrive either as a plain JSON body or as server-sent events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision announced during the handshake
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Fixed client identity used for every handshake
pub const CLIENT_NAME: &str = "toolharness-test-client";

/// Header carrying the server-assigned session
pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC request or notification (no id)
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

/// JSON-RPC response envelope
#[derive(Debug, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Name and version of a protocol peer
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Result of `initialize`
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Implementation,
    #[serde(default)]
    pub capabilities: Value,
}

/// Advertised tool with its schema
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Result of `tools/list`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolInfo>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One content item of a tool result
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Result of `tools/call`
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Content>,
    /// Tool-level failure flag, distinct from a transport error
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl CallToolResult {
    /// Successful result with one text item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            is_error: false,
            structured_content: None,
        }
    }

    /// Tool-level error with one text item
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }

    /// Text content items, in order
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// All text content joined by newlines
    pub fn joined_text(&self) -> String {
        self.texts().collect::<Vec<_>>().join("\n")
    }

    /// Everything a substring expectation may match against
    pub fn rendered(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for item in &self.content {
            match item {
                Content::Text { text } => parts.push(text.clone()),
                Content::Resource { resource } => parts.push(resource.to_string()),
                Content::Image { mime_type, .. } => parts.push(format!("[image {}]", mime_type)),
                Content::Unknown => {}
            }
        }
        if let Some(structured) = &self.structured_content {
            parts.push(structured.to_string());
        }
        parts.join("\n")
    }
}

/// One item returned by `resources/read`
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

/// Result of `resources/read`
#[derive(Debug, Deserialize, Clone)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// Result of `prompts/get`
#[derive(Debug, Deserialize, Clone)]
pub struct GetPromptResult {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Decode an HTTP response body into the JSON-RPC response it carries
///
/// Server-sent event streams may interleave notifications; the first
/// message with a `result` or `error` is the response.
pub fn decode_body(content_type: &str, body: &str) -> Option<JsonRpcResponse> {
    if content_type.starts_with("text/event-stream") {
        return decode_event_stream(body);
    }
    serde_json::from_str(body).ok()
}

fn decode_event_stream(body: &str) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut events = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        } else if line.trim().is_empty() && !data.is_empty() {
            events.push(std::mem::take(&mut data));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events
        .iter()
        .filter_map(|event| serde_json::from_str::<JsonRpcResponse>(event).ok())
        .find(|msg| msg.result.is_some() || msg.error.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_has_no_id() {
        let json = serde_json::to_value(JsonRpcRequest::notification("notifications/initialized"))
            .unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
    }

    #[test]
    fn test_call_tool_result_parsing() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "audio", "data": "..."},
                {"type": "text", "text": "world"}
            ],
            "isError": true
        }))
        .unwrap();
        assert!(result.is_error);
        assert_eq!(result.content[1], Content::Unknown);
        assert_eq!(result.joined_text(), "hello\nworld");
    }

    #[test]
    fn test_rendered_includes_structured_content() {
        let result = CallToolResult {
            structured_content: Some(json!({"status": "created"})),
            ..CallToolResult::text("ok")
        };
        let rendered = result.rendered();
        assert!(rendered.contains("ok"));
        assert!(rendered.contains("\"status\":\"created\""));
    }

    #[test]
    fn test_decode_plain_json() {
        let msg = decode_body("application/json", r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(msg.result.is_some());
        assert!(decode_body("application/json", "not json").is_none());
    }

    #[test]
    fn test_decode_event_stream_skips_notifications() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"error\":{\"code\":-32601,\"message\":\"nope\"}}\n\
                    \n";
        let msg = decode_body("text/event-stream; charset=utf-8", body).unwrap();
        assert_eq!(msg.error.unwrap().code, -32601);
    }
}
