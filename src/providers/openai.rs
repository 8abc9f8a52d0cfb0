//! OpenAI Chat Completions adapter.
//!
//! Streams SSE chunks from `/chat/completions` and normalizes them into the
//! crate's [`StreamEvent`] set. Also covers OpenAI-compatible endpoints
//! (Ollama, vLLM, Azure-style gateways) via [`OpenAIProvider::with_base_url`].
//!
//! The chunk format differs from Anthropic's in two ways the parser has to
//! paper over: tool calls are identified by a `tool_calls[].index` that is
//! separate from content blocks, and there is no explicit per-call end
//! event, so open calls are closed when `finish_reason` arrives.

use crate::conversation::{ContentBlock, Message, Role};
use crate::error::ProviderErrorKind;
use crate::llm::{EventStream, Provider, ProviderRequest, StopReason, StreamEvent};
use crate::types::TokenUsage;
use futures::StreamExt;
use log::{debug, error, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub const MODEL_GPT4O: &str = "gpt-4o";
pub const MODEL_GPT4O_MINI: &str = "gpt-4o-mini";

/// Adapter for the OpenAI Chat Completions API.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAIProvider {
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            model,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    /// Use an OpenAI-compatible endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn gpt4o(api_key: String) -> Self {
        Self::new(api_key, MODEL_GPT4O.to_owned())
    }
}

impl Provider for OpenAIProvider {
    fn send(&self, request: ProviderRequest) -> EventStream<'_> {
        Box::pin(async_stream::stream! {
            let body = WireRequest {
                model: &self.model,
                messages: build_wire_messages(&request),
                tools: build_wire_tools(&request),
                max_completion_tokens: request.max_tokens,
                stream: true,
                stream_options: StreamOptions {
                    include_usage: true,
                },
            };

            debug!(
                "openai request model={} messages={} tools={}",
                self.model,
                request.messages.len(),
                request.tools.len()
            );

            let response = match self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
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
            let mut parser = ChunkParser::default();

            while let Some(chunk) = sse.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        error!("openai stream read failed: {e}");
                        yield StreamEvent::error(
                            ProviderErrorKind::Network,
                            format!("stream error: {e}"),
                        );
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

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
                warn!("openai stream ended without [DONE]");
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
        "openai"
    }
}

fn classify_http_error(status: StatusCode, body: &str) -> StreamEvent {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return StreamEvent::error(ProviderErrorKind::RateLimited, body);
    }
    if status.is_server_error() {
        error!("openai server error status={status}");
        return StreamEvent::error(ProviderErrorKind::ServerError, body);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return StreamEvent::error(ProviderErrorKind::Auth, body);
    }
    if body.contains("context_length_exceeded") || body.contains("maximum context length") {
        return StreamEvent::error(ProviderErrorKind::ContextLengthExceeded, body);
    }
    warn!("openai client error status={status}");
    StreamEvent::error(ProviderErrorKind::InvalidRequest, body)
}

// ============================================================================
// Request wire format
// ============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    max_completion_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunctionCall,
}

#[derive(Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

/// Map the provider-agnostic history into the chat-completions message
/// list: the system prompt leads, tool results become `role: "tool"`
/// messages, and summaries keep the system role (accepted mid-history).
fn build_wire_messages(request: &ProviderRequest) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(request.messages.len() + 1);

    if !request.system.is_empty() {
        wire.push(WireMessage {
            role: "system",
            content: Some(request.system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in &request.messages {
        match message.role {
            Role::Tool => {
                for block in &message.blocks {
                    if let ContentBlock::ToolResult {
                        call_id, content, ..
                    } = block
                    {
                        wire.push(WireMessage {
                            role: "tool",
                            content: Some(content.clone()),
                            tool_calls: None,
                            tool_call_id: Some(call_id.clone()),
                        });
                    }
                }
            }
            Role::System => {
                wire.push(WireMessage {
                    role: "system",
                    content: message.text(),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
            Role::User | Role::Assistant => {
                let tool_calls: Vec<WireToolCall> = message
                    .tool_calls()
                    .map(|(id, name, arguments)| WireToolCall {
                        id: id.to_string(),
                        r#type: "function",
                        function: WireFunctionCall {
                            name: name.to_string(),
                            arguments: serde_json::to_string(arguments)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    })
                    .collect();
                wire.push(WireMessage {
                    role: if message.role == Role::User {
                        "user"
                    } else {
                        "assistant"
                    },
                    content: message.text(),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
        }
    }

    wire
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
                r#type: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect(),
    )
}

// ============================================================================
// Streaming chunk format
// ============================================================================

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Text streams as block 0; tool call `i` maps to block `i + 1` so the
/// accumulator sees distinct, ordered content blocks.
const TOOL_BLOCK_OFFSET: usize = 1;

#[derive(Default)]
struct ChunkParser {
    open_tools: BTreeSet<usize>,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl ChunkParser {
    fn parse_frame(&mut self, frame: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.finished = true;
                events.push(StreamEvent::TurnEnd {
                    stop_reason: self.stop_reason,
                });
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<WireChunk>(data) else {
                warn!("skipping unparseable chunk: {data}");
                continue;
            };
            self.apply_chunk(&chunk, &mut events);
        }
        events
    }

    fn apply_chunk(&mut self, chunk: &WireChunk, events: &mut Vec<StreamEvent>) {
        if let Some(usage) = &chunk.usage {
            events.push(StreamEvent::Usage(TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }));
        }

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                events.push(StreamEvent::TextDelta {
                    index: 0,
                    text: content.clone(),
                });
            }

            for tc in choice.delta.tool_calls.iter().flatten() {
                let block = tc.index + TOOL_BLOCK_OFFSET;
                if let Some(id) = &tc.id {
                    self.open_tools.insert(block);
                    events.push(StreamEvent::ToolCallStart {
                        index: block,
                        id: id.clone(),
                        name: tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default(),
                    });
                }
                if let Some(arguments) = tc.function.as_ref().and_then(|f| f.arguments.as_ref())
                    && !arguments.is_empty()
                {
                    events.push(StreamEvent::ToolCallArgsDelta {
                        index: block,
                        partial_json: arguments.clone(),
                    });
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.stop_reason = Some(match reason.as_str() {
                    "tool_calls" => StopReason::ToolUse,
                    "length" => StopReason::MaxTokens,
                    "content_filter" => StopReason::StopSequence,
                    _ => StopReason::EndTurn,
                });
                // No explicit per-call end on this wire: close them now.
                for block in std::mem::take(&mut self.open_tools) {
                    events.push(StreamEvent::ToolCallEnd { index: block });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_chunks_stream_as_block_zero() {
        let mut parser = ChunkParser::default();
        let events = parser.parse_frame(
            r#"data: {"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        );
        assert!(matches!(
            &events[0],
            StreamEvent::TextDelta { index: 0, text } if text == "Hel"
        ));
    }

    #[test]
    fn tool_call_deltas_map_to_offset_blocks() {
        let mut parser = ChunkParser::default();

        let start = parser.parse_frame(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"list_dir","arguments":""}}]},"finish_reason":null}]}"#,
        );
        assert!(matches!(
            &start[0],
            StreamEvent::ToolCallStart { index: 1, id, name } if id == "call_1" && name == "list_dir"
        ));

        let args = parser.parse_frame(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\": \".\"}"}}]},"finish_reason":null}]}"#,
        );
        assert!(matches!(
            &args[0],
            StreamEvent::ToolCallArgsDelta { index: 1, partial_json } if partial_json.contains("path")
        ));
    }

    #[test]
    fn finish_reason_closes_open_tool_calls() {
        let mut parser = ChunkParser::default();
        parser.parse_frame(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"a","arguments":""}}]},"finish_reason":null}]}"#,
        );
        parser.parse_frame(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_2","function":{"name":"b","arguments":""}}]},"finish_reason":null}]}"#,
        );

        let events =
            parser.parse_frame(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let ends: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCallEnd { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![1, 2]);
    }

    #[test]
    fn done_sentinel_emits_turn_end_with_stop_reason() {
        let mut parser = ChunkParser::default();
        parser.parse_frame(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        let events = parser.parse_frame("data: [DONE]");
        assert!(matches!(
            events[0],
            StreamEvent::TurnEnd {
                stop_reason: Some(StopReason::EndTurn)
            }
        ));
        assert!(parser.finished);
    }

    #[test]
    fn usage_chunk_is_forwarded() {
        let mut parser = ChunkParser::default();
        let events = parser
            .parse_frame(r#"data: {"choices":[],"usage":{"prompt_tokens":11,"completion_tokens":22}}"#);
        assert!(matches!(
            &events[0],
            StreamEvent::Usage(u) if u.input_tokens == 11 && u.output_tokens == 22
        ));
    }

    #[test]
    fn http_status_classification() {
        assert!(matches!(
            classify_http_error(StatusCode::TOO_MANY_REQUESTS, ""),
            StreamEvent::Error {
                kind: ProviderErrorKind::RateLimited,
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"code":"context_length_exceeded"}}"#
            ),
            StreamEvent::Error {
                kind: ProviderErrorKind::ContextLengthExceeded,
                ..
            }
        ));
        assert!(matches!(
            classify_http_error(StatusCode::FORBIDDEN, "no access"),
            StreamEvent::Error {
                kind: ProviderErrorKind::Auth,
                ..
            }
        ));
    }

    #[test]
    fn history_maps_to_chat_roles() {
        let request = ProviderRequest {
            system: "be helpful".to_string(),
            messages: vec![
                Message::summary("[Conversation summary]\n\nearlier"),
                Message::user("list files"),
                Message::assistant_blocks(vec![
                    ContentBlock::Text {
                        text: "on it".to_string(),
                    },
                    ContentBlock::ToolCall {
                        id: "call_1".to_string(),
                        name: "list_dir".to_string(),
                        arguments: json!({ "path": "." }),
                    },
                ]),
                Message::tool_result("call_1", "a.rs", false),
            ],
            tools: Vec::new(),
            max_tokens: 64,
        };
        let wire = build_wire_messages(&request);

        assert_eq!(wire[0].role, "system"); // configured system prompt
        assert_eq!(wire[1].role, "system"); // summary keeps the system role
        assert_eq!(wire[2].role, "user");
        assert_eq!(wire[3].role, "assistant");
        assert!(wire[3].tool_calls.is_some());
        assert_eq!(wire[4].role, "tool");
        assert_eq!(wire[4].tool_call_id.as_deref(), Some("call_1"));
    }
}
