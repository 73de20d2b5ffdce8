use crate::constants::{
    COMPLETION_MODEL, FLUSH_INTERVAL_MS, FLUSH_MIN_CHARS, MAX_STREAM_LINES, MAX_STREAM_LINE_BYTES,
};
use crate::ingress::ChatRequest;
use crate::logging::StreamMetric;
use crate::main_helper::AppState;
use crate::specs::openai::{OpenAiMessage, OpenAiRequest};
use crate::types::*;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Relay lifecycle. Errors at any state jump straight to `Finalizing`; the
/// stream always terminates with the `[DONE]` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    StreamingPrimary,
    ToolsPending,
    StreamingFollowup,
    Finalizing,
    Closed,
}

/// Outbound batching: a frame goes out once the buffer reaches
/// `FLUSH_MIN_CHARS` or `FLUSH_INTERVAL_MS` has passed since the last flush.
/// Pure latency/frame-count policy; the concatenation of flushed frames is
/// always exactly the accumulated text.
struct FlushGate {
    buffer: String,
    last_flush: Instant,
}

impl FlushGate {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            last_flush: Instant::now(),
        }
    }

    fn push(&mut self, delta: &str) {
        self.buffer.push_str(delta);
    }

    fn should_flush(&self) -> bool {
        self.buffer.chars().count() >= FLUSH_MIN_CHARS
            || self.last_flush.elapsed() >= Duration::from_millis(FLUSH_INTERVAL_MS)
    }

    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn take(&mut self) -> String {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.buffer)
    }
}

type FrameSender = mpsc::Sender<std::result::Result<axum::response::sse::Event, StratusError>>;

/// Drives one `POST /chat` turn: primary completion stream, optional tool
/// execution and follow-up stream, then persistence. Spawned as a task; the
/// HTTP handler returns the receiving half as the SSE body.
pub struct ChatRelay {
    state: Arc<AppState>,
    tx: FrameSender,
    chat_id: String,
    request_id: String,
    relay_state: RelayState,
    client_gone: bool,
    full_text: String,
    images: Vec<GeneratedImage>,
}

impl ChatRelay {
    pub fn new(state: Arc<AppState>, tx: FrameSender, chat_id: String, request_id: String) -> Self {
        Self {
            state,
            tx,
            chat_id,
            request_id,
            relay_state: RelayState::Idle,
            client_gone: false,
            full_text: String::new(),
            images: Vec::new(),
        }
    }

    pub async fn run(mut self, request: ChatRequest, prompt: Vec<OpenAiMessage>) {
        let start_time = Instant::now();

        match self.run_pipeline(prompt).await {
            Ok(()) => {
                if !self.client_gone {
                    let event = StreamEvent::ChatAssigned(ChatId(self.chat_id.clone()));
                    self.send_event(&event).await;
                }
            }
            Err(e) => {
                // Whatever the failure, the client sees it as assistant text
                // and the stream still closes cleanly.
                tracing::error!("[☁️  -> ⚙️ ] Relay error: {}", e.inner);
                let suffix = format!("\n\nError: {}", e.inner);
                self.full_text.push_str(&suffix);
                self.send_event(&StreamEvent::Content(suffix)).await;
            }
        }

        self.send_event(&StreamEvent::Done).await;

        // Persistence is off the latency path but guaranteed before the
        // transport closes: the sender is only dropped after this returns.
        self.transition(RelayState::Finalizing);
        if let Err(e) =
            crate::persistence::persist_turn(&self.state, &self.chat_id, &request, &self.full_text, &self.images)
                .await
        {
            tracing::error!(
                "[⚙️  -> 💾 ] Persistence failed for chat [{}...]: {}",
                crate::str_utils::prefix_chars(&self.chat_id, 8),
                e.inner
            );
        }

        self.transition(RelayState::Closed);
        tracing::debug!(
            "[⚙️ ] Relay [{}...] closed after {}ms",
            crate::str_utils::prefix_chars(&self.request_id, 8),
            start_time.elapsed().as_millis()
        );
    }

    async fn run_pipeline(&mut self, prompt: Vec<OpenAiMessage>) -> Result<()> {
        let mut metrics = StreamMetric::new();

        self.transition(RelayState::StreamingPrimary);
        let primary_request = OpenAiRequest {
            model: COMPLETION_MODEL.to_string(),
            messages: prompt.clone(),
            stream: Some(true),
            temperature: None,
            max_tokens: None,
            tools: Some(crate::tools::tool_descriptors()),
        };
        let mut accumulator = self.stream_completion(&primary_request, &mut metrics).await?;

        if accumulator.has_tool_calls() && !self.client_gone {
            self.transition(RelayState::ToolsPending);
            let calls = accumulator.take_tool_calls();
            let outcomes = self.execute_tool_calls(&calls).await;

            if !outcomes.is_empty() {
                self.transition(RelayState::StreamingFollowup);
                let followup_request = OpenAiRequest {
                    model: COMPLETION_MODEL.to_string(),
                    messages: crate::tools::build_followup_messages(prompt, &outcomes),
                    stream: Some(true),
                    temperature: None,
                    max_tokens: None,
                    tools: None,
                };
                self.stream_completion(&followup_request, &mut metrics).await?;
            }
        }

        metrics.log_summary(&self.request_id);
        Ok(())
    }

    /// One upstream streaming call. Text deltas flow to the client under the
    /// flush policy and append to the persistence accumulator; tool-call
    /// deltas assemble silently.
    async fn stream_completion(
        &mut self,
        request: &OpenAiRequest,
        metrics: &mut StreamMetric,
    ) -> Result<ResponseAccumulator> {
        let response = self.state.upstream.stream_chat(request).await?;

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_STREAM_LINE_BYTES),
        );

        let mut accumulator = ResponseAccumulator::new();
        let mut gate = FlushGate::new();
        let mut line_count = 0usize;
        let mut stream_error: Option<StratusError> = None;

        while let Some(line_result) = lines.next().await {
            if self.client_gone {
                // Dropping the reader cancels the upstream request
                break;
            }
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                stream_error = Some(StratusError::Internal(
                    "Stream exceeded max line limit".to_string(),
                    tracing_error::SpanTrace::capture(),
                ));
                break;
            }

            let line = match line_result {
                Ok(l) => l,
                Err(e) => {
                    stream_error = Some(line_codec_error(e));
                    break;
                }
            };

            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                break;
            }

            match parse_provider_line(data) {
                LineEvent::Chunk(chunk) => {
                    metrics.record_chunk(&chunk);
                    let delta = accumulator.push_chunk(chunk);
                    if !delta.is_empty() {
                        self.full_text.push_str(&delta);
                        gate.push(&delta);
                        if gate.should_flush() {
                            let content = gate.take();
                            self.send_event(&StreamEvent::Content(content)).await;
                        }
                    }
                }
                LineEvent::Error(err) => {
                    let status = err
                        .error
                        .code
                        .and_then(|c| axum::http::StatusCode::from_u16(c).ok())
                        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
                    stream_error = Some(StratusError::Upstream(status, err.error.message));
                    break;
                }
                LineEvent::Unknown(_) => {}
            }
        }

        // The remainder always flushes so the client text matches the
        // accumulator byte for byte.
        if !gate.is_empty() {
            let content = gate.take();
            self.send_event(&StreamEvent::Content(content)).await;
        }

        match stream_error {
            Some(e) => Err(e.into()),
            None => Ok(accumulator),
        }
    }

    /// Sequential tool execution. Each successful image is announced to the
    /// client immediately, before the follow-up narrative begins. Failures
    /// are isolated per call.
    async fn execute_tool_calls(&mut self, calls: &[ToolCallBuffer]) -> Vec<crate::tools::ToolOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            tracing::info!(
                "[⚙️ ] Executing tool call '{}' ({})",
                call.name,
                crate::str_utils::prefix_chars(&call.id, 16)
            );
            let Some(outcome) = crate::tools::execute_call(&self.state, call).await else {
                continue;
            };
            if let Some(image) = &outcome.image {
                self.images.push(image.clone());
                let event = StreamEvent::ToolResult(ToolResultPayload::Image {
                    url: image.url.clone(),
                    prompt: image.prompt.clone(),
                });
                self.send_event(&event).await;
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn send_event(&mut self, event: &StreamEvent) {
        if self.client_gone {
            return;
        }
        let frame = axum::response::sse::Event::default().data(event.encode());
        if self.tx.send(Ok(frame)).await.is_err() {
            tracing::trace!("Client disconnected, suppressing further frames");
            self.client_gone = true;
        }
    }

    fn transition(&mut self, next: RelayState) {
        tracing::trace!(
            "[⚙️ ] Relay [{}...] {:?} -> {:?}",
            crate::str_utils::prefix_chars(&self.request_id, 8),
            self.relay_state,
            next
        );
        self.relay_state = next;
    }
}

fn line_codec_error(e: tokio_util::codec::LinesCodecError) -> StratusError {
    match e {
        tokio_util::codec::LinesCodecError::Io(io) => StratusError::Io(io),
        tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
            StratusError::Io(std::io::Error::other("Max line length exceeded"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_flushes_at_min_chars() {
        let mut gate = FlushGate::new();
        gate.push("He");
        assert!(gate.buffer.chars().count() < FLUSH_MIN_CHARS);
        gate.push("l");
        assert!(gate.should_flush());
        assert_eq!(gate.take(), "Hel");
        assert!(gate.is_empty());
    }

    #[test]
    fn test_gate_flushes_after_interval() {
        let mut gate = FlushGate::new();
        gate.push("a");
        gate.last_flush = Instant::now() - Duration::from_millis(FLUSH_INTERVAL_MS + 1);
        assert!(gate.should_flush());
    }

    #[test]
    fn test_gate_counts_chars_not_bytes() {
        let mut gate = FlushGate::new();
        gate.last_flush = Instant::now() + Duration::from_secs(60);
        gate.push("é");
        // Two bytes but one char: not enough to flush on size alone
        assert!(!gate.should_flush());
    }
}
