//! Context compaction for long-running conversations.
//!
//! When the estimated token count of the history crosses a configured
//! fraction of the model's context window, older turns are replaced by a
//! single synthesized summary message while the most recent turns are kept
//! verbatim. The split always lands on a turn boundary, so a tool call is
//! never separated from its result, and re-running compaction on a history
//! that is already under budget is a no-op.
//!
//! Whether summaries come from the model itself (spending budget) or from a
//! deterministic heuristic is a policy choice: pick a [`Summarizer`].

use crate::budget::{self, ModelFamily};
use crate::conversation::{ContentBlock, Conversation, Message, Role};
use crate::llm::{Provider, ProviderRequest, StreamEvent, TurnAccumulator};
use crate::types::ModelConfig;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use std::fmt::Write;
use std::sync::Arc;

/// Controls when and how much compaction keeps.
#[derive(Clone, Debug)]
pub struct CompactionConfig {
    /// Fraction of the context window that triggers compaction.
    pub budget_fraction: f32,
    /// Complete recent turns kept verbatim.
    pub retain_recent_turns: usize,
    /// Minimum history length before compaction is considered.
    pub min_messages: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            budget_fraction: 0.8,
            retain_recent_turns: 3,
            min_messages: 8,
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub const fn with_budget_fraction(mut self, fraction: f32) -> Self {
        self.budget_fraction = fraction;
        self
    }

    #[must_use]
    pub const fn with_retain_recent_turns(mut self, turns: usize) -> Self {
        self.retain_recent_turns = turns;
        self
    }

    #[must_use]
    pub const fn with_min_messages(mut self, count: usize) -> Self {
        self.min_messages = count;
        self
    }
}

/// What happened during a compaction pass.
#[derive(Clone, Debug)]
pub struct CompactionReport {
    pub original_count: usize,
    pub new_count: usize,
    pub original_tokens: usize,
    pub new_tokens: usize,
}

/// Strategy for condensing older turns into a summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Condense `messages` into summary text.
    ///
    /// # Errors
    /// Returns an error if summarization fails; the caller keeps the full
    /// history in that case.
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

/// Deterministic summarizer: a structured digest of what happened, built
/// without any model call. Costs nothing and cannot fail mid-turn.
pub struct HeuristicSummarizer {
    /// Characters kept per quoted fragment.
    max_fragment: usize,
}

impl Default for HeuristicSummarizer {
    fn default() -> Self {
        Self { max_fragment: 160 }
    }
}

impl HeuristicSummarizer {
    #[must_use]
    pub const fn new(max_fragment: usize) -> Self {
        Self { max_fragment }
    }

    fn clip(&self, text: &str) -> String {
        if text.chars().count() <= self.max_fragment {
            text.to_string()
        } else {
            let prefix: String = text.chars().take(self.max_fragment).collect();
            format!("{prefix}...")
        }
    }
}

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let mut out = String::new();
        for message in messages {
            match message.role {
                Role::User => {
                    if let Some(text) = message.text() {
                        let _ = writeln!(out, "User asked: {}", self.clip(&text));
                    }
                }
                Role::Assistant => {
                    if let Some(text) = message.text() {
                        let _ = writeln!(out, "Assistant: {}", self.clip(&text));
                    }
                    for (_, name, arguments) in message.tool_calls() {
                        let args = serde_json::to_string(arguments).unwrap_or_default();
                        let _ = writeln!(out, "Called {name} with {}", self.clip(&args));
                    }
                }
                Role::Tool => {
                    for block in &message.blocks {
                        if let ContentBlock::ToolResult {
                            content, is_error, ..
                        } = block
                        {
                            let status = if is_error.unwrap_or(false) {
                                "failed"
                            } else {
                                "returned"
                            };
                            let _ = writeln!(out, "Tool {status}: {}", self.clip(content));
                        }
                    }
                }
                Role::System => {
                    if message.summary
                        && let Some(text) = message.text()
                    {
                        // Fold an earlier summary into the new one.
                        let _ = writeln!(out, "{text}");
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Summarizer that asks the model to condense the history. Higher fidelity
/// than the heuristic, at the cost of tokens and a network round-trip.
pub struct ModelSummarizer<P: Provider> {
    provider: Arc<P>,
    max_tokens: u32,
}

impl<P: Provider> ModelSummarizer<P> {
    #[must_use]
    pub const fn new(provider: Arc<P>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
        }
    }

    fn render_for_prompt(messages: &[Message]) -> String {
        let mut out = String::new();
        for message in messages {
            let role = match message.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let _ = write!(out, "{role}: ");
            for block in &message.blocks {
                match block {
                    ContentBlock::Text { text } => {
                        let _ = writeln!(out, "{text}");
                    }
                    ContentBlock::ToolCall {
                        name, arguments, ..
                    } => {
                        let _ = writeln!(
                            out,
                            "[called {name} with {}]",
                            serde_json::to_string(arguments).unwrap_or_default()
                        );
                    }
                    ContentBlock::ToolResult {
                        content, is_error, ..
                    } => {
                        let status = if is_error.unwrap_or(false) {
                            "error"
                        } else {
                            "ok"
                        };
                        let clipped = if content.chars().count() > 500 {
                            let prefix: String = content.chars().take(500).collect();
                            format!("{prefix}... (truncated)")
                        } else {
                            content.clone()
                        };
                        let _ = writeln!(out, "[tool result ({status}): {clipped}]");
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl<P: Provider> Summarizer for ModelSummarizer<P> {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let rendered = Self::render_for_prompt(messages);
        let prompt = format!(
            r"Summarize this conversation concisely, preserving:
- Key decisions and conclusions reached
- Important file paths, code changes, and technical details
- Current task context and what has been accomplished
- Any pending items, errors encountered, or next steps

Conversation:
{rendered}

Provide a concise summary:"
        );

        let request = ProviderRequest {
            system: "You are a precise summarizer. Preserve every technical detail needed to continue the work.".to_string(),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            max_tokens: self.max_tokens,
        };

        let mut stream = self.provider.send(request);
        let mut accumulator = TurnAccumulator::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::Error { message, .. } = &event {
                bail!("summarization request failed: {message}");
            }
            accumulator.apply(&event);
        }
        accumulator
            .into_message()
            .text()
            .context("no text in summarization response")
    }
}

/// Applies the compaction policy to a conversation.
#[derive(Clone, Debug)]
pub struct Compactor {
    config: CompactionConfig,
}

impl Compactor {
    #[must_use]
    pub const fn new(config: CompactionConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &CompactionConfig {
        &self.config
    }

    fn threshold(&self, model: &ModelConfig) -> usize {
        let window = model
            .context_window
            .unwrap_or_else(|| ModelFamily::from_model(&model.model).context_window());
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let threshold = (window as f32 * self.config.budget_fraction) as usize;
        threshold
    }

    /// Whether a pass over this history would shrink it.
    #[must_use]
    pub fn needs_compaction(&self, conversation: &Conversation, model: &ModelConfig) -> bool {
        if conversation.len() < self.config.min_messages {
            return false;
        }
        budget::estimate(conversation.snapshot(), &model.model) > self.threshold(model)
    }

    /// Index where the retained tail begins: the start of the
    /// `retain_recent_turns`-th turn from the end. Splitting at a turn start
    /// cannot separate a tool call from its result.
    fn split_point(&self, conversation: &Conversation) -> Option<usize> {
        let starts = conversation.turn_starts();
        if starts.len() <= self.config.retain_recent_turns {
            return None;
        }
        let split = starts[starts.len() - self.config.retain_recent_turns];
        (split > 0).then_some(split)
    }

    /// Run one compaction pass if the history is over budget.
    ///
    /// Returns `Ok(None)` when nothing was done (under budget, too short,
    /// or no splittable prefix) — which is what makes repeated calls on an
    /// already-compacted history a no-op.
    ///
    /// # Errors
    /// Returns an error only if the summarizer fails; the conversation is
    /// left untouched in that case.
    pub async fn compact(
        &self,
        conversation: &mut Conversation,
        model: &ModelConfig,
        summarizer: &dyn Summarizer,
    ) -> Result<Option<CompactionReport>> {
        if !self.needs_compaction(conversation, model) {
            return Ok(None);
        }
        let Some(split) = self.split_point(conversation) else {
            debug!("history over budget but no whole-turn prefix to fold");
            return Ok(None);
        };

        let messages = conversation.snapshot();
        let original_count = messages.len();
        let original_tokens = budget::estimate(messages, &model.model);

        // A leading instruction message survives compaction verbatim.
        let keep_leading = usize::from(
            messages
                .first()
                .is_some_and(|m| m.role == Role::System && !m.summary),
        );
        let to_fold = &messages[keep_leading..split];
        let summary_text = summarizer.summarize(to_fold).await?;

        let mut new_messages = Vec::with_capacity(original_count - to_fold.len() + 1);
        new_messages.extend(messages[..keep_leading].iter().cloned());
        new_messages.push(Message::summary(format!(
            "[Conversation summary]\n\n{summary_text}"
        )));
        new_messages.extend(messages[split..].iter().cloned());

        let new_count = new_messages.len();
        let new_tokens = budget::estimate(&new_messages, &model.model);
        conversation.replace(new_messages);

        Ok(Some(CompactionReport {
            original_count,
            new_count,
            original_tokens,
            new_tokens,
        }))
    }
}
