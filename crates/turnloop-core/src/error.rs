//! Error kinds for the session core.
//!
//! One enum backs every behavioral error kind named by the contract: callers
//! match on `CoreError::kind()` rather than comparing strings.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("already streaming")]
    AlreadyStreaming,

    #[error("aborted")]
    Aborted,

    #[error("stream failed: {wire_kind}")]
    StreamFailed { wire_kind: String },

    #[error("tool crashed: {detail}")]
    ToolCrashed { detail: String },

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("cannot compact: no valid cut point")]
    CannotCompact,

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown entry: {0}")]
    UnknownEntry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// The behavioral taxonomy from the error-handling contract, independent of
/// the concrete variant's payload. Used so callers can branch on "what kind
/// of failure" without matching the full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AlreadyStreaming,
    Aborted,
    StreamFailed,
    ToolCrashed,
    UnknownTool,
    CannotCompact,
    PersistenceFailed,
    InvalidInput,
    UnknownEntry,
    Io,
    Json,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyStreaming => ErrorKind::AlreadyStreaming,
            Self::Aborted => ErrorKind::Aborted,
            Self::StreamFailed { .. } => ErrorKind::StreamFailed,
            Self::ToolCrashed { .. } => ErrorKind::ToolCrashed,
            Self::UnknownTool { .. } => ErrorKind::UnknownTool,
            Self::CannotCompact => ErrorKind::CannotCompact,
            Self::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::UnknownEntry(_) => ErrorKind::UnknownEntry,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn tool_crashed(detail: impl Into<String>) -> Self {
        Self::ToolCrashed {
            detail: detail.into(),
        }
    }

    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool { name: name.into() }
    }

    pub fn stream_failed(wire_kind: impl Into<String>) -> Self {
        Self::StreamFailed {
            wire_kind: wire_kind.into(),
        }
    }

    pub fn invalid_input(detail: impl Into<String>) -> Self {
        Self::InvalidInput(detail.into())
    }

    pub fn persistence_failed(detail: impl Into<String>) -> Self {
        Self::PersistenceFailed(detail.into())
    }

    pub fn unknown_entry(id: impl Into<String>) -> Self {
        Self::UnknownEntry(id.into())
    }
}
