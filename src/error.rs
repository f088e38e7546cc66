/// Typed failure modes for the session core.
///
/// Errors are classifications the engine acts on, not just strings: transient
/// provider errors feed the retry controller, permanent ones surface to the
/// caller, cancellation is terminal and never retried.
use std::time::Duration;

use thiserror::Error;

// ── Provider error classification ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 429 — eligible for retry, may carry a retry-after hint.
    RateLimit,
    /// Provider reports overload (e.g. 529).
    Overloaded,
    /// Connection failure, disconnect, timeout.
    Network,
    /// 5xx server error.
    Server,
    /// 401/403 — not retried.
    Auth,
    /// 4xx other than rate limit — not retried.
    InvalidRequest,
    /// The provider rejected a feature (e.g. images on a text-only model).
    Unsupported,
}

impl ProviderErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Overloaded
                | ProviderErrorKind::Network
                | ProviderErrorKind::Server
        )
    }

    /// Best-effort classification from an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => ProviderErrorKind::Auth,
            429 => ProviderErrorKind::RateLimit,
            529 => ProviderErrorKind::Overloaded,
            500..=599 => ProviderErrorKind::Server,
            _ => ProviderErrorKind::InvalidRequest,
        }
    }

    /// Best-effort classification from an error message, for providers that
    /// only surface a reason string on the stream.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("rate limit") || lower.contains("rate_limit") {
            ProviderErrorKind::RateLimit
        } else if lower.contains("overload") {
            ProviderErrorKind::Overloaded
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("disconnect")
            || lower.contains("timed out")
            || lower.contains("timeout")
        {
            ProviderErrorKind::Network
        } else if lower.contains("unauthorized")
            || lower.contains("authentication")
            || lower.contains("api key")
        {
            ProviderErrorKind::Auth
        } else if lower.contains("unsupported") {
            ProviderErrorKind::Unsupported
        } else {
            ProviderErrorKind::Server
        }
    }
}

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AgentError {
    /// A second `prompt` while a turn is streaming.
    #[error("a turn is already in progress")]
    AlreadyProcessing,

    /// The turn was explicitly aborted. Terminal; never retried.
    #[error("turn was aborted")]
    Cancelled,

    #[error("provider error: {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
        /// Explicit retry-after hint from the provider, if any.
        retry_after: Option<Duration>,
    },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A `session_before_compact` hook vetoed the compaction.
    #[error("compaction cancelled by hook: {reason}")]
    CompactionCancelled { reason: String },

    #[error("session log corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported session schema version {found} (newest supported is {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("unknown entry id: {0}")]
    UnknownEntry(String),

    #[error("nothing to compact on this branch")]
    NothingToCompact,

    #[error("no session files found in {0}")]
    NoRecentSession(String),

    /// A required field was not set on the session builder.
    #[error("session builder is missing {0}")]
    BuilderIncomplete(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    pub fn provider(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        AgentError::Provider {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// True for errors the retry controller may act on.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Provider { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AgentError::Cancelled)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
