//! coda - orchestration core for an LLM-powered coding-assistant CLI.
//!
//! This crate is the engine behind an interactive assistant: it turns one
//! user request into a sequence of LLM calls interleaved with tool
//! executions, keeps the growing conversation under a context budget,
//! normalizes streaming across provider backends, and persists sessions so
//! they resume exactly where they left off.
//!
//! The CLI surface (argument parsing, rendering, prompt widgets) and the
//! concrete tools (file edit, shell, search) live outside this crate and
//! plug in through [`Tool`] and the [`events::AgentEvent`] stream.
//!
//! # Example
//!
//! ```ignore
//! use coda::{
//!     AgentConfig, AgentLoop, ModelConfig, SessionManager, ToolRegistry,
//!     providers::AnthropicProvider,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = Arc::new(AnthropicProvider::sonnet(api_key));
//! let mut tools = ToolRegistry::new();
//! tools.register(MyListDirTool)?;
//!
//! let sessions = SessionManager::new(std::env::current_dir()?);
//! let mut session = sessions.create(ModelConfig::new("anthropic", provider.model()));
//!
//! let agent = AgentLoop::new(provider, tools, sessions, AgentConfig::default());
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let turn = agent.run_turn(&mut session, "list the files here", tx, CancellationToken::new());
//!
//! // elsewhere: render events from rx as they arrive
//! ```

#![forbid(unsafe_code)]

mod agent_loop;
pub mod budget;
pub mod compaction;
mod conversation;
mod error;
pub mod events;
mod executor;
mod llm;
pub mod providers;
mod session;
mod tools;
mod types;

pub use agent_loop::{AgentLoop, TurnResult};
pub use compaction::{CompactionConfig, HeuristicSummarizer, ModelSummarizer, Summarizer};
pub use conversation::{ContentBlock, Conversation, Message, PairingViolation, Role};
pub use error::{AgentError, ProviderErrorKind};
pub use events::AgentEvent;
pub use executor::{ExecutorConfig, ToolCallRequest, ToolExecutor, ToolResultRecord, ToolStatus};
pub use llm::{
    EventStream, Provider, ProviderRequest, StopReason, StreamEvent, ToolSchema, TurnAccumulator,
};
pub use session::{Session, SessionManager, SessionSummary};
pub use tools::{RegistryError, Tool, ToolContext, ToolRegistry};
pub use types::{AgentConfig, ModelConfig, RetryConfig, SessionId, TokenUsage};
