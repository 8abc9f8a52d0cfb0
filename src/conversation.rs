//! Provider-agnostic conversation model.
//!
//! A [`Conversation`] is an append-only ordered sequence of [`Message`]s.
//! Messages are immutable once appended; compaction produces a new sequence
//! rather than editing messages in place.
//!
//! Structural invariant: every `ToolCall` emitted by an assistant message is
//! resolved by exactly one `ToolResult` block before the next provider
//! request. [`Conversation::verify_tool_pairing`] checks this over the whole
//! sequence and is used by tests and by compaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One block of message content.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    /// A tool invocation requested by the assistant.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },

    /// The outcome of a tool invocation, linked to its call by `call_id`.
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// One conversation entry. `summary` marks messages synthesized by
/// compaction in place of older history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    pub blocks: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            summary: false,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            summary: false,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            summary: false,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    #[must_use]
    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            summary: false,
            blocks,
        }
    }

    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            summary: false,
            blocks: vec![ContentBlock::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error: is_error.then_some(true),
            }],
        }
    }

    /// A compaction summary standing in for older history.
    #[must_use]
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            summary: true,
            blocks: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text content, if any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Iterate over the tool calls in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.blocks.iter().filter_map(|b| match b {
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }))
    }

    #[must_use]
    pub fn has_tool_results(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

/// A violation found by [`Conversation::verify_tool_pairing`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingViolation {
    /// A tool call was never answered before the next request boundary.
    Unresolved { call_id: String },
    /// A tool result references no pending call (orphaned or duplicated).
    Unmatched { call_id: String },
}

impl std::fmt::Display for PairingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved { call_id } => write!(f, "tool call {call_id} has no result"),
            Self::Unmatched { call_id } => write!(f, "tool result {call_id} matches no call"),
        }
    }
}

/// Append-only ordered message history.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// The ordered message sequence.
    #[must_use]
    pub fn snapshot(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Replace the full history. Only compaction and session resume use
    /// this; normal operation is append-only.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Indices of turn starts: non-summary user messages that carry no tool
    /// results. Tool rounds live strictly between two turn starts, so a
    /// split at a turn start can never separate a call from its result.
    #[must_use]
    pub fn turn_starts(&self) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User && !m.summary && !m.has_tool_results())
            .map(|(i, _)| i)
            .collect()
    }

    /// Tool call ids that have not yet received a result.
    #[must_use]
    pub fn unresolved_calls(&self) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for message in &self.messages {
            for block in &message.blocks {
                match block {
                    ContentBlock::ToolCall { id, .. } => pending.push(id.clone()),
                    ContentBlock::ToolResult { call_id, .. } => {
                        pending.retain(|p| p != call_id);
                    }
                    ContentBlock::Text { .. } => {}
                }
            }
        }
        pending
    }

    /// Check the tool-pairing invariant over the whole sequence.
    ///
    /// Every assistant `ToolCall` must be answered exactly once before the
    /// next assistant or user message; results must reference a pending
    /// call. The sequence must end with no pending calls.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn verify_tool_pairing(&self) -> Result<(), PairingViolation> {
        let mut pending: Vec<String> = Vec::new();

        for message in &self.messages {
            match message.role {
                Role::Assistant | Role::User | Role::System => {
                    if let Some(call_id) = pending.first() {
                        return Err(PairingViolation::Unresolved {
                            call_id: call_id.clone(),
                        });
                    }
                }
                Role::Tool => {}
            }

            for block in &message.blocks {
                match block {
                    ContentBlock::ToolCall { id, .. } => pending.push(id.clone()),
                    ContentBlock::ToolResult { call_id, .. } => {
                        let Some(pos) = pending.iter().position(|p| p == call_id) else {
                            return Err(PairingViolation::Unmatched {
                                call_id: call_id.clone(),
                            });
                        };
                        pending.remove(pos);
                    }
                    ContentBlock::Text { .. } => {}
                }
            }
        }

        if let Some(call_id) = pending.first() {
            return Err(PairingViolation::Unresolved {
                call_id: call_id.clone(),
            });
        }
        Ok(())
    }
}
