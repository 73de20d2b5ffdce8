use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChatId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ToolCallId(pub String);

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for ChatId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl ChatId {
    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToolCallId {
    pub fn new() -> Self {
        Self(format!("call_{}", Uuid::new_v4().simple()))
    }
}

impl Default for ToolCallId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Error, Debug)]
pub enum StratusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: StratusError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<StratusError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            StratusError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            StratusError::InvalidRequest(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_REQUEST",
            ),
            StratusError::Unauthorized(m) => (
                axum::http::StatusCode::UNAUTHORIZED,
                m.clone(),
                "UNAUTHORIZED",
            ),
            StratusError::Configuration(m) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "CONFIGURATION_ERROR",
            ),
            StratusError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            StratusError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            StratusError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            StratusError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            StratusError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- CORE ROLES ---

/// Only user and assistant turns are ever persisted; system and tool turns
/// exist solely inside an upstream request payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// --- STORED TRANSCRIPT ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttachment {
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    /// base64 data URL, `data:<mime>;base64,<payload>`
    pub data: String,
}

impl FileAttachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    pub fn size_kb(&self) -> String {
        format!("{:.1}", self.size as f64 / 1024.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// A fully-normalized persisted turn. Every field the ordering and edit
/// machinery relies on is guaranteed present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub files: Option<Vec<FileAttachment>>,
    #[serde(default)]
    pub images: Option<Vec<GeneratedImage>>,
    pub created_at: String,
    pub message_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
}

/// The shape messages may take on disk, including rows written before
/// ids and sequence numbers existed. Normalized exactly once at the
/// storage boundary (`persistence::normalize_stored`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessageRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub files: Option<Vec<FileAttachment>>,
    #[serde(default)]
    pub images: Option<Vec<GeneratedImage>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub message_number: Option<u32>,
    #[serde(default)]
    pub edited: Option<bool>,
    #[serde(default)]
    pub edited_at: Option<String>,
}

/// --- OUTBOUND STREAM EVENTS ---

/// Everything the relay multiplexes onto the SSE transport. `encode`/`decode`
/// are the single framing boundary; nothing else hand-builds frame strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    ToolResult(ToolResultPayload),
    ChatAssigned(ChatId),
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResultPayload {
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

impl StreamEvent {
    /// Produces the payload portion of one SSE frame (`data: <payload>`).
    pub fn encode(&self) -> String {
        match self {
            StreamEvent::Content(text) => {
                serde_json::json!({ "content": text }).to_string()
            }
            StreamEvent::ToolResult(payload) => {
                let data = serde_json::to_string(payload).unwrap_or_default();
                serde_json::json!({ "type": "function_result", "data": data }).to_string()
            }
            StreamEvent::ChatAssigned(chat_id) => {
                serde_json::json!({ "type": "chat_id", "chatId": chat_id.0 }).to_string()
            }
            StreamEvent::Done => "[DONE]".to_string(),
        }
    }

    pub fn decode(data: &str) -> Result<StreamEvent> {
        if data == "[DONE]" {
            return Ok(StreamEvent::Done);
        }
        let value: serde_json::Value = serde_json::from_str(data)?;
        if let Some(content) = value.get("content").and_then(|c| c.as_str()) {
            return Ok(StreamEvent::Content(content.to_string()));
        }
        match value.get("type").and_then(|t| t.as_str()) {
            Some("function_result") => {
                let inner = value
                    .get("data")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default();
                let payload: ToolResultPayload = serde_json::from_str(inner)?;
                Ok(StreamEvent::ToolResult(payload))
            }
            Some("chat_id") => {
                let id = value
                    .get("chatId")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default();
                Ok(StreamEvent::ChatAssigned(ChatId(id.to_string())))
            }
            other => Err(StratusError::InvalidRequest(format!(
                "Unknown stream event type: {:?}",
                other
            ))
            .into()),
        }
    }
}

/// --- PROVIDER WIRE TYPES ---

#[derive(serde::Deserialize, Debug)]
pub enum LineEvent {
    Chunk(CompletionChunk),
    Error(ProviderError),
    Unknown(String),
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct CompletionChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<FunctionDelta>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug, Clone)]
pub struct FunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(serde::Deserialize, serde::Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    pub code: Option<u16>,
}

pub fn parse_provider_line(data: &str) -> LineEvent {
    if data.len() > 10 * 1024 * 1024 {
        return LineEvent::Error(ProviderError {
            error: ProviderErrorDetails {
                message: format!("JSON chunk too large: {} bytes", data.len()),
                code: Some(413),
            },
        });
    }
    // Try Error first as it's more specific (requires "error" key)
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(chunk) = serde_json::from_str::<CompletionChunk>(data) {
        if !chunk.choices.is_empty() {
            return LineEvent::Chunk(chunk);
        }
    }
    let snippet = crate::str_utils::prefix_chars(data, 200);
    tracing::debug!("[STREAM] Unknown line format: {}", snippet);
    LineEvent::Unknown(data.to_string())
}

/// --- STREAM ACCUMULATION ---

/// In-flight tool call assembled from argument deltas.
#[derive(Debug, Clone)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Collects one upstream stream into final text plus pending tool calls.
/// Deltas arrive keyed by index; ids may show up on any delta for that index.
#[derive(Default)]
pub struct ResponseAccumulator {
    pub text: String,
    pub tool_calls: Vec<ToolCallBuffer>,
    index_map: std::collections::HashMap<u32, usize>,
    pub finish_reason: Option<String>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a chunk in and returns the text delta it carried (possibly
    /// empty), so the caller can feed the outbound flush buffer.
    pub fn push_chunk(&mut self, chunk: CompletionChunk) -> String {
        let mut delta_text = String::new();
        for choice in chunk.choices {
            if self.finish_reason.is_none() {
                self.finish_reason = choice.finish_reason;
            }
            if let Some(content) = choice.delta.content {
                self.text.push_str(&content);
                delta_text.push_str(&content);
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let slot = match self.index_map.get(&tc.index) {
                    Some(i) => *i,
                    None => {
                        self.tool_calls.push(ToolCallBuffer {
                            id: String::new(),
                            name: String::new(),
                            arguments: String::new(),
                        });
                        let i = self.tool_calls.len() - 1;
                        self.index_map.insert(tc.index, i);
                        i
                    }
                };
                let entry = &mut self.tool_calls[slot];
                if let Some(id) = tc.id {
                    if !id.is_empty() {
                        entry.id = id;
                    }
                }
                if let Some(f) = tc.function {
                    if let Some(name) = f.name {
                        if !name.is_empty() {
                            entry.name = name;
                        }
                    }
                    if let Some(args) = f.arguments {
                        entry.arguments.push_str(&args);
                    }
                }
            }
        }
        delta_text
    }

    /// Completed tool calls, with ids backfilled for providers that never
    /// sent one.
    pub fn take_tool_calls(&mut self) -> Vec<ToolCallBuffer> {
        let mut calls = std::mem::take(&mut self.tool_calls);
        self.index_map.clear();
        for call in &mut calls {
            if call.id.is_empty() {
                call.id = ToolCallId::new().0;
            }
        }
        calls
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_frame_shape() {
        let ev = StreamEvent::Content("Hel".to_string());
        assert_eq!(ev.encode(), r#"{"content":"Hel"}"#);
    }

    #[test]
    fn test_chat_id_frame_shape() {
        let ev = StreamEvent::ChatAssigned(ChatId("abc-123".to_string()));
        let value: serde_json::Value = serde_json::from_str(&ev.encode()).unwrap();
        assert_eq!(value["type"], "chat_id");
        assert_eq!(value["chatId"], "abc-123");
    }

    #[test]
    fn test_function_result_frame_double_encodes_payload() {
        let ev = StreamEvent::ToolResult(ToolResultPayload::Image {
            url: "data:image/png;base64,QUJD".to_string(),
            prompt: Some("a cat".to_string()),
        });
        let value: serde_json::Value = serde_json::from_str(&ev.encode()).unwrap();
        assert_eq!(value["type"], "function_result");
        // The data field is itself a JSON-encoded string
        let inner: serde_json::Value =
            serde_json::from_str(value["data"].as_str().unwrap()).unwrap();
        assert_eq!(inner["type"], "image");
        assert_eq!(inner["prompt"], "a cat");
    }

    #[test]
    fn test_done_sentinel_is_not_json() {
        assert_eq!(StreamEvent::Done.encode(), "[DONE]");
    }

    #[test]
    fn test_decode_roundtrip() {
        let events = vec![
            StreamEvent::Content("hello".to_string()),
            StreamEvent::ToolResult(ToolResultPayload::Image {
                url: "https://example.com/x.png".to_string(),
                prompt: None,
            }),
            StreamEvent::ChatAssigned(ChatId("c1".to_string())),
            StreamEvent::Done,
        ];
        for ev in events {
            let decoded = StreamEvent::decode(&ev.encode()).unwrap();
            assert_eq!(decoded, ev);
        }
    }

    #[test]
    fn test_parse_provider_chunk() {
        let json = r#"{"id":"123","model":"gpt-5-mini","choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        match parse_provider_line(json) {
            LineEvent::Chunk(c) => assert_eq!(c.id, "123"),
            _ => panic!("Expected Chunk"),
        }
    }

    #[test]
    fn test_parse_provider_error() {
        let json = r#"{"error":{"message":"overloaded","code":529}}"#;
        match parse_provider_line(json) {
            LineEvent::Error(e) => assert_eq!(e.error.message, "overloaded"),
            _ => panic!("Expected Error"),
        }
    }

    #[test]
    fn test_parse_unknown_line() {
        match parse_provider_line(r#"{"choices":[]}"#) {
            LineEvent::Unknown(_) => {}
            _ => panic!("Expected Unknown"),
        }
    }

    #[test]
    fn test_accumulator_concatenates_text() {
        let mut acc = ResponseAccumulator::new();
        for part in ["Hel", "lo"] {
            let chunk = CompletionChunk {
                id: String::new(),
                model: String::new(),
                choices: vec![ChunkChoice {
                    delta: ChunkDelta {
                        content: Some(part.to_string()),
                        role: None,
                        tool_calls: None,
                    },
                    finish_reason: None,
                }],
            };
            acc.push_chunk(chunk);
        }
        assert_eq!(acc.text, "Hello");
        assert!(!acc.has_tool_calls());
    }

    #[test]
    fn test_accumulator_assembles_tool_call_across_chunks() {
        let mut acc = ResponseAccumulator::new();
        let deltas = vec![
            ToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                function: Some(FunctionDelta {
                    name: Some("generate_image".to_string()),
                    arguments: Some("{\"prompt\":".to_string()),
                }),
            },
            ToolCallDelta {
                index: 0,
                id: None,
                function: Some(FunctionDelta {
                    name: None,
                    arguments: Some("\"a cat\"}".to_string()),
                }),
            },
        ];
        for delta in deltas {
            let chunk = CompletionChunk {
                id: String::new(),
                model: String::new(),
                choices: vec![ChunkChoice {
                    delta: ChunkDelta {
                        content: None,
                        role: None,
                        tool_calls: Some(vec![delta]),
                    },
                    finish_reason: None,
                }],
            };
            acc.push_chunk(chunk);
        }
        let calls = acc.take_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "generate_image");
        assert_eq!(calls[0].arguments, "{\"prompt\":\"a cat\"}");
    }

    #[test]
    fn test_accumulator_backfills_missing_tool_call_id() {
        let mut acc = ResponseAccumulator::new();
        let chunk = CompletionChunk {
            id: String::new(),
            model: String::new(),
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: None,
                    role: None,
                    tool_calls: Some(vec![ToolCallDelta {
                        index: 0,
                        id: None,
                        function: Some(FunctionDelta {
                            name: Some("generate_image".to_string()),
                            arguments: Some("{}".to_string()),
                        }),
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
        };
        acc.push_chunk(chunk);
        let calls = acc.take_tool_calls();
        assert!(calls[0].id.starts_with("call_"));
    }
}
