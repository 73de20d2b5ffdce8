use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-stratus-request-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id and wraps it in a span so stream tasks can
/// be correlated with the request that spawned them.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    next.run(req).instrument(span).await
}

/// Rolling counters for one relay invocation (primary plus follow-up).
#[derive(Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub text_chars: usize,
    pub tool_parts: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, chunk: &crate::types::CompletionChunk) {
        self.chunks += 1;
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text_chars += content.len();
            }
            if let Some(tools) = &choice.delta.tool_calls {
                self.tool_parts += tools.len();
                for t in tools {
                    if let Some(f) = &t.function {
                        if let Some(name) = &f.name {
                            if !name.is_empty() {
                                self.tool_names.push(name.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn log_summary(&self, request_id: &str) {
        let tools_str = if self.tool_names.is_empty() {
            format!("{}", self.tool_parts)
        } else {
            format!("{} ({})", self.tool_parts, self.tool_names.join(", "))
        };

        info!(
            target: "relay",
            "[STREAM END] Request: [{}...] | Chunks: {} | Tools: {} | Text: {} chars",
            crate::str_utils::prefix_chars(request_id, 8),
            self.chunks,
            tools_str,
            self.text_chars
        );
    }
}
