//! The polymorphic `Message` type: the unit of conversation content carried
//! inside `message`-typed journal entries.

use serde::{Deserialize, Serialize};

use crate::content::{ContentBlock, ImageAttachment, StopReason, Usage};

/// Textual or mixed-content body of a User message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.estimable_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<&str> for UserContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for UserContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// A single conversation message. Tagged by `role` at the wire boundary so
/// stored journals read naturally as `{"role": "...", ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<ImageAttachment>,
        timestamp: i64,
    },
    Assistant {
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        timestamp: i64,
    },
    ToolResult {
        /// Canonical on output. `tool_use_id` is accepted as an input alias
        /// for cross-version compatibility with journals written by
        /// producers that used the other name.
        #[serde(alias = "toolUseId", rename = "toolCallId")]
        tool_call_id: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
        timestamp: i64,
    },
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: i64) -> Self {
        Self::User {
            content: UserContent::Text(text.into()),
            images: Vec::new(),
            timestamp,
        }
    }

    pub fn user_with_images(
        text: impl Into<String>,
        images: Vec<ImageAttachment>,
        timestamp: i64,
    ) -> Self {
        Self::User {
            content: UserContent::Text(text.into()),
            images,
            timestamp,
        }
    }

    pub fn assistant(
        content: Vec<ContentBlock>,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
        timestamp: i64,
    ) -> Self {
        Self::Assistant {
            content,
            stop_reason,
            usage,
            timestamp,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        content: Vec<ContentBlock>,
        is_error: bool,
        timestamp: i64,
    ) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.into(),
            content,
            is_error,
            timestamp,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::ToolResult { .. } => "tool_result",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::ToolResult { timestamp, .. } => *timestamp,
        }
    }

    /// ToolCall blocks embedded in this message, if it is an Assistant
    /// message that ended with `stop_reason = tool_use`.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        match self {
            Self::Assistant { content, .. } => {
                content.iter().filter_map(|b| b.as_tool_call()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(
            self,
            Self::Assistant {
                stop_reason: Some(StopReason::ToolUse),
                ..
            }
        )
    }

    /// The text-extractable portion used by the compaction token estimator:
    /// User text, Assistant text blocks, ToolResult text blocks. Images,
    /// thinking blocks and tool-call argument payloads are excluded.
    pub fn estimable_text(&self) -> String {
        match self {
            Self::User { content, .. } => content.text(),
            Self::Assistant { content, .. } | Self::ToolResult { content, .. } => content
                .iter()
                .filter_map(|b| b.estimable_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}
