//! Errors produced by a `StreamFn` implementation.

use thiserror::Error;

/// The wire-level classification a `StreamFn` reports, used by the agent
/// loop to decide whether `stream_failed` is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    Network,
    ServerError,
    RateLimited,
    AuthFailed,
    ContextOverflow,
    InvalidResponse,
    Cancelled,
}

impl WireErrorKind {
    /// `stream_failed{wire_kind}` is retried only for network/5xx/429
    /// failures, per the error-handling contract.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::ServerError | Self::RateLimited)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::AuthFailed => "auth_failed",
            Self::ContextOverflow => "context_overflow",
            Self::InvalidResponse => "invalid_response",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("context window exceeded")]
    ContextOverflow,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl LlmError {
    pub fn wire_kind(&self) -> WireErrorKind {
        match self {
            Self::RequestFailed(_) => WireErrorKind::ServerError,
            Self::AuthFailed(_) => WireErrorKind::AuthFailed,
            Self::RateLimited { .. } => WireErrorKind::RateLimited,
            Self::ContextOverflow => WireErrorKind::ContextOverflow,
            Self::InvalidResponse(_) => WireErrorKind::InvalidResponse,
            Self::StreamError(_) => WireErrorKind::ServerError,
            Self::Cancelled => WireErrorKind::Cancelled,
            Self::Network(_) => WireErrorKind::Network,
        }
    }
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;
