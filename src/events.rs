//! Events streamed to the caller during a turn.
//!
//! The CLI layer consumes these over an async channel for responsive
//! output: incremental text as it arrives, tool invocations as they start
//! and finish (for transparency), compaction notices, and exactly one
//! terminal event (`Done`, `Failed`, or `Cancelled`) per turn.

use crate::executor::ToolStatus;
use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};

/// Events emitted by the agent loop during execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A provider round-trip is starting (1-based within the turn).
    RoundStarted { round: usize },

    /// A fragment of assistant text, forwarded as soon as it arrives.
    TextDelta { text: String },

    /// Complete assistant text for the round.
    Text { text: String },

    /// The assistant requested a tool invocation.
    ToolCallStarted {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// A tool invocation resolved.
    ToolCallFinished {
        id: String,
        name: String,
        status: ToolStatus,
        content: String,
        duration_ms: Option<u64>,
    },

    /// History was compacted to fit the context budget.
    ContextCompacted {
        original_count: usize,
        new_count: usize,
        original_tokens: usize,
        new_tokens: usize,
    },

    /// A transient provider error is being retried after backoff.
    Retrying {
        attempt: u32,
        delay_ms: u64,
        message: String,
    },

    /// The turn completed with a final answer.
    Done {
        final_text: String,
        rounds: usize,
        usage: TokenUsage,
    },

    /// The turn failed; the session itself may remain usable.
    Failed { error: String, retryable: bool },

    /// The turn was cancelled by the caller.
    Cancelled { rounds: usize },
}

impl AgentEvent {
    #[must_use]
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn done(final_text: impl Into<String>, rounds: usize, usage: TokenUsage) -> Self {
        Self::Done {
            final_text: final_text.into(),
            rounds,
            usage,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self::Failed {
            error: error.into(),
            retryable,
        }
    }

    /// True for `Done`, `Failed`, and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(AgentEvent::done("bye", 1, TokenUsage::default()).is_terminal());
        assert!(AgentEvent::failed("boom", false).is_terminal());
        assert!(AgentEvent::Cancelled { rounds: 2 }.is_terminal());
        assert!(!AgentEvent::text_delta("hi").is_terminal());
        assert!(!AgentEvent::RoundStarted { round: 1 }.is_terminal());
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = AgentEvent::ToolCallFinished {
            id: "c1".to_string(),
            name: "list_dir".to_string(),
            status: ToolStatus::Ok,
            content: "a.rs".to_string(),
            duration_ms: Some(12),
        };
        let json: serde_json::Value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "tool_call_finished");
        assert_eq!(json["status"], "ok");
    }
}
