//! Provider adapter contract.
//!
//! Heterogeneous backend streaming formats are normalized into one
//! [`StreamEvent`] set, implemented once per backend behind the
//! [`Provider`] trait. The orchestration loop never sees protocol quirks.
//!
//! Adapters never retry internally: failures arrive in-band as
//! [`StreamEvent::Error`] with a classification, and the retry policy lives
//! in the agent loop so backoff state is visible in logs and events.

use crate::conversation::{ContentBlock, Message};
use crate::error::ProviderErrorKind;
use crate::types::TokenUsage;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;

/// Tool declaration passed to the provider.
#[derive(Clone, Debug, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One request to a provider: the conversation snapshot plus tool schemas.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub max_tokens: u32,
}

/// Why the model stopped producing output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

/// A normalized incremental unit of a provider's streamed response.
///
/// Tool-call arguments may be split across arbitrarily many
/// `ToolCallArgsDelta` events; consumers must buffer them and parse only
/// once `ToolCallEnd` is observed.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A fragment of assistant text for content block `index`.
    TextDelta { index: usize, text: String },

    /// A tool call opened at block `index`; id and name are known.
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },

    /// Partial JSON for the arguments of the tool call at block `index`.
    ToolCallArgsDelta { index: usize, partial_json: String },

    /// The tool call at block `index` is complete.
    ToolCallEnd { index: usize },

    /// Token accounting, typically near stream end.
    Usage(TokenUsage),

    /// The assistant turn is complete.
    TurnEnd { stop_reason: Option<StopReason> },

    /// A classified failure. Terminates the stream.
    Error {
        kind: ProviderErrorKind,
        retryable: bool,
        message: String,
    },
}

impl StreamEvent {
    #[must_use]
    pub fn error(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            retryable: kind.retryable(),
            message: message.into(),
        }
    }
}

/// Lazy event sequence produced by an adapter.
pub type EventStream<'a> = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'a>>;

/// Uniform interface over LLM backends.
pub trait Provider: Send + Sync {
    /// Dispatch one request and stream back normalized events.
    fn send(&self, request: ProviderRequest) -> EventStream<'_>;

    /// The model id this adapter targets.
    fn model(&self) -> &str;

    /// Backend family name (`"anthropic"`, `"openai"`, ...).
    fn name(&self) -> &'static str;
}

enum BlockAccumulator {
    Text(String),
    ToolCall {
        id: String,
        name: String,
        args_json: String,
        arguments: Option<Value>,
    },
}

/// Rebuilds a complete assistant [`Message`] from stream events.
///
/// Content is keyed by block index so interleaved text and tool-call blocks
/// come out in stream order. Tool-call argument JSON is buffered and parsed
/// when `ToolCallEnd` arrives; an empty buffer parses to `{}`, malformed
/// JSON to `null` (the executor then rejects it against the tool's schema).
#[derive(Default)]
pub struct TurnAccumulator {
    blocks: BTreeMap<usize, BlockAccumulator>,
    usage: Option<TokenUsage>,
    stop_reason: Option<StopReason>,
}

impl TurnAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::TextDelta { index, text } => {
                match self
                    .blocks
                    .entry(*index)
                    .or_insert_with(|| BlockAccumulator::Text(String::new()))
                {
                    BlockAccumulator::Text(buf) => buf.push_str(text),
                    BlockAccumulator::ToolCall { .. } => {}
                }
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.blocks.insert(
                    *index,
                    BlockAccumulator::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        args_json: String::new(),
                        arguments: None,
                    },
                );
            }
            StreamEvent::ToolCallArgsDelta {
                index,
                partial_json,
            } => {
                if let Some(BlockAccumulator::ToolCall { args_json, .. }) =
                    self.blocks.get_mut(index)
                {
                    args_json.push_str(partial_json);
                }
            }
            StreamEvent::ToolCallEnd { index } => {
                if let Some(BlockAccumulator::ToolCall {
                    args_json,
                    arguments,
                    ..
                }) = self.blocks.get_mut(index)
                {
                    *arguments = Some(parse_buffered_args(args_json));
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(usage.clone()),
            StreamEvent::TurnEnd { stop_reason } => self.stop_reason = *stop_reason,
            StreamEvent::Error { .. } => {}
        }
    }

    #[must_use]
    pub const fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.usage.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.blocks
            .values()
            .any(|b| matches!(b, BlockAccumulator::ToolCall { .. }))
    }

    /// Finalize into an assistant message, preserving block order.
    ///
    /// Tool calls whose `ToolCallEnd` never arrived (a provider cutting the
    /// stream short) are parsed from whatever buffered JSON exists.
    #[must_use]
    pub fn into_message(self) -> Message {
        let blocks = self
            .blocks
            .into_values()
            .filter_map(|block| match block {
                BlockAccumulator::Text(text) => {
                    if text.is_empty() {
                        None
                    } else {
                        Some(ContentBlock::Text { text })
                    }
                }
                BlockAccumulator::ToolCall {
                    id,
                    name,
                    args_json,
                    arguments,
                } => Some(ContentBlock::ToolCall {
                    id,
                    name,
                    arguments: arguments.unwrap_or_else(|| parse_buffered_args(&args_json)),
                }),
            })
            .collect();
        Message::assistant_blocks(blocks)
    }
}

fn parse_buffered_args(buffered: &str) -> Value {
    if buffered.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(buffered).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: usize, text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            index,
            text: text.to_string(),
        }
    }

    #[test]
    fn accumulates_text_deltas() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "Hello"));
        acc.apply(&delta(0, " world"));

        let msg = acc.into_message();
        assert_eq!(msg.text().as_deref(), Some("Hello world"));
    }

    #[test]
    fn parses_args_split_across_many_deltas() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ToolCallStart {
            index: 0,
            id: "call_1".to_string(),
            name: "read".to_string(),
        });
        for piece in ["{\"pa", "th\": \"sr", "c/main.rs\"", "}"] {
            acc.apply(&StreamEvent::ToolCallArgsDelta {
                index: 0,
                partial_json: piece.to_string(),
            });
        }
        acc.apply(&StreamEvent::ToolCallEnd { index: 0 });

        let msg = acc.into_message();
        let calls: Vec<_> = msg.tool_calls().collect();
        assert_eq!(calls.len(), 1);
        let (id, name, args) = calls[0];
        assert_eq!(id, "call_1");
        assert_eq!(name, "read");
        assert_eq!(args["path"], "src/main.rs");
    }

    #[test]
    fn empty_args_become_empty_object() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ToolCallStart {
            index: 0,
            id: "c".to_string(),
            name: "noop".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallEnd { index: 0 });

        let msg = acc.into_message();
        let (_, _, args) = msg.tool_calls().next().expect("one call");
        assert!(args.is_object());
    }

    #[test]
    fn malformed_args_become_null() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ToolCallStart {
            index: 0,
            id: "c".to_string(),
            name: "broken".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallArgsDelta {
            index: 0,
            partial_json: "not json {".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallEnd { index: 0 });

        let msg = acc.into_message();
        let (_, _, args) = msg.tool_calls().next().expect("one call");
        assert!(args.is_null());
    }

    #[test]
    fn interleaved_blocks_keep_stream_order() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&delta(0, "Checking the directory."));
        acc.apply(&StreamEvent::ToolCallStart {
            index: 1,
            id: "call_2".to_string(),
            name: "list_dir".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallArgsDelta {
            index: 1,
            partial_json: "{\"path\": \".\"}".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallEnd { index: 1 });
        acc.apply(&StreamEvent::Usage(TokenUsage {
            input_tokens: 12,
            output_tokens: 34,
        }));
        acc.apply(&StreamEvent::TurnEnd {
            stop_reason: Some(StopReason::ToolUse),
        });

        assert!(acc.has_tool_calls());
        assert_eq!(acc.stop_reason(), Some(StopReason::ToolUse));
        assert_eq!(acc.usage().output_tokens, 34);

        let msg = acc.into_message();
        assert!(matches!(msg.blocks[0], ContentBlock::Text { .. }));
        assert!(matches!(msg.blocks[1], ContentBlock::ToolCall { .. }));
    }

    #[test]
    fn unterminated_call_still_parses_buffered_json() {
        let mut acc = TurnAccumulator::new();
        acc.apply(&StreamEvent::ToolCallStart {
            index: 0,
            id: "c".to_string(),
            name: "read".to_string(),
        });
        acc.apply(&StreamEvent::ToolCallArgsDelta {
            index: 0,
            partial_json: "{\"path\": \"x\"}".to_string(),
        });
        // No ToolCallEnd: finalization falls back to the buffer.
        let msg = acc.into_message();
        let (_, _, args) = msg.tool_calls().next().expect("one call");
        assert_eq!(args["path"], "x");
    }

    #[test]
    fn empty_accumulator_yields_empty_message() {
        let msg = TurnAccumulator::new().into_message();
        assert!(msg.blocks.is_empty());
        assert!(msg.text().is_none());
    }

    #[test]
    fn error_event_classification_helper() {
        let event = StreamEvent::error(ProviderErrorKind::RateLimited, "429");
        match event {
            StreamEvent::Error {
                kind, retryable, ..
            } => {
                assert_eq!(kind, ProviderErrorKind::RateLimited);
                assert!(retryable);
            }
            _ => panic!("expected error event"),
        }
    }
}
