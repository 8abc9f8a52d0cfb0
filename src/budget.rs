//! Token estimation for context budgeting.
//!
//! A deliberately cheap heuristic (~4 characters per token plus per-block
//! overheads) used only to gate compaction, never for billing. The estimate
//! is deterministic and monotonic: appending a message never decreases it.

use crate::conversation::{ContentBlock, Message};

/// Model family inferred from a model id, used to pick the context window
/// and per-message framing overhead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gpt,
    Other,
}

impl ModelFamily {
    #[must_use]
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        if lower.contains("claude") {
            Self::Claude
        } else if lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
            Self::Gpt
        } else {
            Self::Other
        }
    }

    /// Context window size in tokens.
    #[must_use]
    pub const fn context_window(self) -> usize {
        match self {
            Self::Claude => 200_000,
            Self::Gpt | Self::Other => 128_000,
        }
    }

    /// Framing overhead per message (role tags, separators).
    const fn message_overhead(self) -> usize {
        match self {
            Self::Claude => 5,
            Self::Gpt | Self::Other => 4,
        }
    }
}

/// Characters per token. Conservative for English text and code.
const CHARS_PER_TOKEN: usize = 4;

/// Overhead for tool-call blocks (id, name, framing).
const TOOL_CALL_OVERHEAD: usize = 20;

/// Overhead for tool-result blocks (id, framing).
const TOOL_RESULT_OVERHEAD: usize = 10;

/// Estimate tokens for a text string.
#[must_use]
pub const fn estimate_text(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

fn estimate_block(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => estimate_text(text),
        ContentBlock::ToolCall {
            name, arguments, ..
        } => {
            let args = serde_json::to_string(arguments).unwrap_or_default();
            estimate_text(name) + estimate_text(&args) + TOOL_CALL_OVERHEAD
        }
        ContentBlock::ToolResult { content, .. } => estimate_text(content) + TOOL_RESULT_OVERHEAD,
    }
}

/// Estimate tokens for a single message under the given model family.
#[must_use]
pub fn estimate_message(message: &Message, family: ModelFamily) -> usize {
    let content: usize = message.blocks.iter().map(estimate_block).sum();
    content + family.message_overhead()
}

/// Estimate total tokens for a message sequence sent to `model`.
#[must_use]
pub fn estimate(messages: &[Message], model: &str) -> usize {
    let family = ModelFamily::from_model(model);
    messages.iter().map(|m| estimate_message(m, family)).sum()
}
