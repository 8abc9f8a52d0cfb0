//! The orchestrator: turns one user request into a sequence of provider
//! calls interleaved with tool executions.
//!
//! One [`AgentLoop`] drives one session at a time — [`AgentLoop::run_turn`]
//! takes `&mut Session`, so the type system enforces that no two requests
//! for the same conversation are ever in flight simultaneously. Separate
//! sessions run fully in parallel on separate loop instances.

mod helpers;
mod run_loop;
#[cfg(test)]
mod test_utils;

pub use run_loop::TurnResult;

use crate::compaction::{CompactionConfig, Compactor, HeuristicSummarizer, Summarizer};
use crate::events::AgentEvent;
use crate::executor::{ExecutorConfig, ToolExecutor};
use crate::llm::Provider;
use crate::session::{Session, SessionManager};
use crate::tools::ToolRegistry;
use crate::types::AgentConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The agent loop. Holds everything a turn needs: the provider adapter,
/// the tool registry and executor, the compaction policy, and the session
/// manager used to persist at turn boundaries.
pub struct AgentLoop<P: Provider> {
    provider: Arc<P>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    compactor: Compactor,
    summarizer: Arc<dyn Summarizer>,
    sessions: SessionManager,
    config: AgentConfig,
}

impl<P: Provider> AgentLoop<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        registry: ToolRegistry,
        sessions: SessionManager,
        config: AgentConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        Self {
            executor: ToolExecutor::new(Arc::clone(&registry), ExecutorConfig::default()),
            compactor: Compactor::new(CompactionConfig::default()),
            summarizer: Arc::new(HeuristicSummarizer::default()),
            provider,
            registry,
            sessions,
            config,
        }
    }

    /// Replace the tool executor configuration.
    #[must_use]
    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = ToolExecutor::new(Arc::clone(&self.registry), config);
        self
    }

    /// Replace the compaction policy.
    #[must_use]
    pub fn with_compaction(mut self, config: CompactionConfig) -> Self {
        self.compactor = Compactor::new(config);
        self
    }

    /// Choose how compaction summaries are produced (model-backed or
    /// deterministic heuristic).
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Run one user turn to completion.
    ///
    /// Events stream over `events` while the turn runs — incremental text
    /// immediately, tool notifications per round, and exactly one terminal
    /// event matching the returned [`TurnResult`]. Cancellation is
    /// cooperative: it is observed between stream events and between tool
    /// completions, and every pending tool call is still resolved in the
    /// recorded history.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: impl Into<String>,
        events: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> TurnResult {
        run_loop::drive(self, session, input.into(), &events, &cancel).await
    }
}
