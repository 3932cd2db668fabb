//! Content blocks, stop reasons and usage counters shared by every message
//! variant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single piece of an Assistant message's content, or a piece of a
/// ToolResult's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { text: String },
    ToolCall {
        id: String,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
}

impl ContentBlock {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    pub fn thinking(s: impl Into<String>) -> Self {
        Self::Thinking { text: s.into() }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// The text contribution of this block to a compaction token estimate.
    /// Thinking blocks and tool-call argument payloads are excluded from the
    /// text sum per the estimator's contract.
    pub fn estimable_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Thinking { .. } | Self::ToolCall { .. } => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<(&str, &str, &Value)> {
        match self {
            Self::ToolCall { id, name, arguments } => Some((id, name, arguments)),
            _ => None,
        }
    }
}

/// Terminal reason an Assistant message's generation stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Stop,
    ToolUse,
    MaxTokens,
    ContentFilter,
    Aborted,
    Error,
}

impl StopReason {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Stop | Self::MaxTokens | Self::ContentFilter)
    }
}

/// Token usage counters. Any subset may be present; `total()` sums whichever
/// of the four are present unless the producer supplied `total_tokens`
/// explicitly, in which case that value wins.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.total_tokens
            .unwrap_or(self.input + self.output + self.cache_read + self.cache_write)
    }

    /// Merge another usage snapshot in, following "last wins" for fields the
    /// newer snapshot actually sets. Used when a stream fires multiple
    /// `usage` events for the same message.
    pub fn merge_latest(&mut self, latest: Usage) {
        *self = latest;
    }
}

/// A base64-encoded image attached to a User message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub data: String,
    pub mime_type: String,
}
