//! Anthropic Messages API adapter.
//!
//! Streams SSE from `/v1/messages` and normalizes the wire events into the
//! crate's [`StreamEvent`] set. The adapter classifies failures but never
//! retries; retry policy belongs to the agent loop.

use crate::conversation::{ContentBlock, Message, Role};
use crate::error::ProviderErrorKind;
use crate::llm::{EventStream, Provider, ProviderRequest, StopReason, StreamEvent};
use crate::types::TokenUsage;
use futures::StreamExt;
use log::{debug, error, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const API_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub const MODEL_HAIKU: &str = "claude-haiku-4-5-20251001";
pub const MODEL_SONNET: &str = "claude-sonnet-4-5-20250929";
pub const MODEL_OPUS: &str = "claude-opus-4-6";

/// Adapter for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        // No overall timeout: streams legitimately run for minutes. Connect
        // timeout and keepalive still bound the transport.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            model,
            base_url: API_BASE_URL.to_owned(),
        }
    }

    /// Point the adapter at a different endpoint (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn sonnet(api_key: String) -> Self {
        Self::new(api_key, MODEL_SONNET.to_owned())
    }

    #[must_use]
    pub fn haiku(api_key: String) -> Self {
        Self::new(api_key, MODEL_HAIKU.to_owned())
    }
}

impl Provider for AnthropicProvider {
    fn send(&self, request: ProviderRequest) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            let body = WireRequest {
                model: &self.model,
                max_tokens: request.max_tokens,
                system: &request.system,
                messages: build_wire_messages(&request.messages),
                tools: build_wire_tools(&request),
                stream: true,
            };

            debug!(
                "anthropic request model={} messages={} tools={}",
                self.model,
                request.messages.len(),
                request.tools.len()
            );

            let response = match self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("Content-Type", "application/json")
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let kind = if e.is_timeout() {
                        ProviderErrorKind::Timeout
                    } else {
                        ProviderErrorKind::Network
                    };
                    yield StreamEvent::error(kind, format!("request failed: {e}"));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                yield classify_http_error(status, &body);
                return;
            }

            let mut sse = response.bytes_stream();
            let mut buffer = String::new();
            let mut parser = SseParser::default();

            while let Some(chunk) = sse.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        error!("anthropic stream read failed: {e}");
                        yield StreamEvent::error(
                            ProviderErrorKind::Network,
                            format!("stream error: {e}"),
                        );
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are separated by a blank line.
                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for event in parser.parse_frame(&frame) {
                        yield event;
                    }
                }
            }

            let remaining = buffer.trim().to_string();
            if !remaining.is_empty() {
                for event in parser.parse_frame(&remaining) {
                    yield event;
                }
            }

            if !parser.finished {
                warn!("anthropic stream ended without message_stop");
                yield StreamEvent::error(
                    ProviderErrorKind::Network,
                    "stream ended before completion",
                );
            }
        })
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

fn classify_http_error(status: StatusCode, body: &str) -> StreamEvent {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return StreamEvent::error(ProviderErrorKind::RateLimited, body);
    }
    if status.is_server_error() {
        error!("anthropic server error status={status}");
        return StreamEvent::error(ProviderErrorKind::ServerError, body);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return StreamEvent::error(ProviderErrorKind::Auth, body);
    }
    if body.contains("prompt is too long") || body.contains("context window") {
        return StreamEvent::error(ProviderErrorKind::ContextLengthExceeded, body);
    }
    warn!("anthropic client error status={status}");
    StreamEvent::error(ProviderErrorKind::InvalidRequest, body)
}

// ============================================================================
// Request wire format
// ============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    stream: bool,
}

#[derive(Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Map the provider-agnostic history into Anthropic's two-role scheme:
/// tool results ride in user messages, and system-role entries (compaction
/// summaries) become user text.
fn build_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::Assistant => "assistant",
                Role::User | Role::Tool | Role::System => "user",
            };
            let content = message
                .blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
                    ContentBlock::ToolCall {
                        id,
                        name,
                        arguments,
                    } => WireBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: arguments.clone(),
                    },
                    ContentBlock::ToolResult {
                        call_id,
                        content,
                        is_error,
                    } => WireBlock::ToolResult {
                        tool_use_id: call_id.clone(),
                        content: content.clone(),
                        is_error: *is_error,
                    },
                })
                .collect();
            WireMessage { role, content }
        })
        .collect()
}

fn build_wire_tools(request: &ProviderRequest) -> Option<Vec<WireTool>> {
    if request.tools.is_empty() {
        return None;
    }
    Some(
        request
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect(),
    )
}

// ============================================================================
// SSE wire format
// ============================================================================

#[derive(Deserialize)]
struct SseMessageStart {
    message: SseMessageStartInner,
}

#[derive(Deserialize)]
struct SseMessageStartInner {
    usage: SseInputUsage,
}

#[derive(Deserialize)]
struct SseInputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct SseBlockStart {
    index: usize,
    content_block: SseBlock,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum SseBlock {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct SseBlockDelta {
    index: usize,
    delta: SseDelta,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum SseDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct SseBlockStop {
    index: usize,
}

#[derive(Deserialize)]
struct SseMessageDelta {
    delta: SseMessageDeltaInner,
    usage: SseOutputUsage,
}

#[derive(Deserialize)]
struct SseMessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct SseOutputUsage {
    output_tokens: u32,
}

/// Stateful SSE-to-[`StreamEvent`] translator for one response.
#[derive(Default)]
struct SseParser {
    input_tokens: u32,
    output_tokens: u32,
    tool_blocks: HashSet<usize>,
    stop_reason: Option<StopReason>,
    context_overflow: bool,
    finished: bool,
}

impl SseParser {
    fn parse_frame(&mut self, frame: &str) -> Vec<StreamEvent> {
        let mut event_type = None;
        let mut data = None;
        for line in frame.lines() {
            if let Some(value) = line.strip_prefix("event: ") {
                event_type = Some(value.trim());
            } else if let Some(value) = line.strip_prefix("data: ") {
                data = Some(value);
            }
        }
        let Some(data) = data else {
            return Vec::new();
        };

        match event_type {
            Some("message_start") => {
                if let Ok(start) = serde_json::from_str::<SseMessageStart>(data) {
                    self.input_tokens = start.message.usage.input_tokens;
                }
                Vec::new()
            }
            Some("content_block_start") => {
                match serde_json::from_str::<SseBlockStart>(data) {
                    Ok(SseBlockStart {
                        index,
                        content_block: SseBlock::ToolUse { id, name },
                    }) => {
                        self.tool_blocks.insert(index);
                        vec![StreamEvent::ToolCallStart { index, id, name }]
                    }
                    _ => Vec::new(),
                }
            }
            Some("content_block_delta") => match serde_json::from_str::<SseBlockDelta>(data) {
                Ok(SseBlockDelta {
                    index,
                    delta: SseDelta::Text { text },
                }) => vec![StreamEvent::TextDelta { index, text }],
                Ok(SseBlockDelta {
                    index,
                    delta: SseDelta::InputJson { partial_json },
                }) => vec![StreamEvent::ToolCallArgsDelta {
                    index,
                    partial_json,
                }],
                _ => Vec::new(),
            },
            Some("content_block_stop") => match serde_json::from_str::<SseBlockStop>(data) {
                Ok(SseBlockStop { index }) if self.tool_blocks.contains(&index) => {
                    vec![StreamEvent::ToolCallEnd { index }]
                }
                _ => Vec::new(),
            },
            Some("message_delta") => {
                if let Ok(delta) = serde_json::from_str::<SseMessageDelta>(data) {
                    self.output_tokens = delta.usage.output_tokens;
                    match delta.delta.stop_reason.as_deref() {
                        Some("tool_use") => self.stop_reason = Some(StopReason::ToolUse),
                        Some("max_tokens") => self.stop_reason = Some(StopReason::MaxTokens),
                        Some("stop_sequence") => self.stop_reason = Some(StopReason::StopSequence),
                        Some("model_context_window_exceeded") => self.context_overflow = true,
                        Some(_) => self.stop_reason = Some(StopReason::EndTurn),
                        None => {}
                    }
                }
                Vec::new()
            }
            Some("message_stop") => {
                self.finished = true;
                if self.context_overflow {
                    return vec![StreamEvent::error(
                        ProviderErrorKind::ContextLengthExceeded,
                        "model context window exceeded",
                    )];
                }
                vec![
                    StreamEvent::Usage(TokenUsage {
                        input_tokens: self.input_tokens,
                        output_tokens: self.output_tokens,
                    }),
                    StreamEvent::TurnEnd {
                        stop_reason: self.stop_reason,
                    },
                ]
            }
            _ => Vec::new(),
        }
    }
}
