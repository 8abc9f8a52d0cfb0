//! Error taxonomy for the orchestration core.
//!
//! Provider failures carry a [`ProviderErrorKind`] plus a `retryable` flag;
//! the agent loop absorbs retryable errors up to the configured attempt
//! ceiling and surfaces everything else as a terminal [`AgentError`].
//! Tool validation and execution failures never appear here: they are
//! converted into error tool results so the model can react to them.

use crate::types::SessionId;

/// Classification of a provider-side failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Request or stream read timed out.
    Timeout,
    /// Transport-level failure (connect, DNS, dropped stream).
    Network,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError,
    /// Authentication or authorization rejected.
    Auth,
    /// The request itself was malformed or rejected.
    InvalidRequest,
    /// The conversation no longer fits the model's context window.
    ContextLengthExceeded,
}

impl ProviderErrorKind {
    /// Default retryability for this kind. Adapters may override the flag
    /// on individual events, but classification and default agree.
    #[must_use]
    pub const fn retryable(self) -> bool {
        match self {
            Self::Timeout | Self::Network | Self::RateLimited | Self::ServerError => true,
            Self::Auth | Self::InvalidRequest | Self::ContextLengthExceeded => false,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::ContextLengthExceeded => "context_length_exceeded",
        };
        f.write_str(s)
    }
}

/// Terminal errors surfaced by the agent loop and session manager.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        retryable: bool,
        message: String,
    },

    #[error("maximum tool rounds ({limit}) reached")]
    MaxToolRounds { limit: usize },

    #[error("retries exhausted after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error("session persistence failed: {0}")]
    Persistence(String),
}

impl AgentError {
    #[must_use]
    pub fn provider(kind: ProviderErrorKind, retryable: bool, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            retryable,
            message: message.into(),
        }
    }

    /// Whether the next user turn on the same session is expected to work.
    ///
    /// Budget exhaustion fails the turn but leaves the session usable;
    /// transient provider errors may clear up on their own.
    #[must_use]
    pub const fn session_usable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::MaxToolRounds { .. } | Self::RetriesExhausted { .. } | Self::Persistence(_) => {
                true
            }
            Self::SessionNotFound { .. } => false,
        }
    }
}
