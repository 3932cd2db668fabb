//! `SessionEntry`: the immutable node type stored in the journal tree.

use serde::{Deserialize, Serialize};

use crate::content::ContentBlock;
use crate::message::Message;

/// The payload carried by a custom-message entry: opaque content that
/// participates in context building but is always a valid compaction cut
/// point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CustomContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl CustomContent {
    pub fn estimable_text(&self) -> String {
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

/// The per-type payload of a `SessionEntry`. Tagged by `type` at the wire
/// boundary; field names within each variant are camelCase to match the
/// rest of the persisted journal format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EntryKind {
    #[serde(rename = "message")]
    Message { message: Message },

    #[serde(rename = "custom_message")]
    CustomMessage {
        #[serde(rename = "customType")]
        custom_type: String,
        #[serde(default)]
        content: Option<CustomContent>,
        #[serde(default)]
        display: bool,
    },

    #[serde(rename = "model_change")]
    ModelChange {
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },

    #[serde(rename = "summary")]
    Summary {
        #[serde(rename = "summaryText")]
        summary_text: String,
        #[serde(rename = "replacedRange")]
        replaced_range: (String, String),
    },
}

/// An immutable node in the session journal's tree. Once appended, never
/// mutated; edits create new entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntry {
    pub id: String,
    #[serde(rename = "parentId")]
    pub parent_id: Option<String>,
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl SessionEntry {
    pub fn new(id: impl Into<String>, parent_id: Option<String>, timestamp: i64, kind: EntryKind) -> Self {
        Self {
            id: id.into(),
            parent_id,
            timestamp,
            kind,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match &self.kind {
            EntryKind::Message { message } => Some(message),
            _ => None,
        }
    }

    /// A valid compaction cut point is a `message` entry with role user or
    /// assistant, or a `custom_message` entry. ToolResult messages, and
    /// entries whose message is absent/unrecognized, are never valid.
    pub fn is_cut_point_candidate(&self) -> bool {
        match &self.kind {
            EntryKind::Message { message } => {
                matches!(message, Message::User { .. } | Message::Assistant { .. })
            }
            EntryKind::CustomMessage { .. } => true,
            EntryKind::ModelChange { .. } | EntryKind::Summary { .. } => false,
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(
            &self.kind,
            EntryKind::Message {
                message: Message::ToolResult { .. }
            }
        )
    }

    /// ToolCall blocks embedded in this entry, if it is an Assistant
    /// message.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.as_message().map(Message::tool_calls).unwrap_or_default()
    }

    pub fn tool_result_id(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Message {
                message: Message::ToolResult { tool_call_id, .. },
            } => Some(tool_call_id),
            _ => None,
        }
    }

    /// The text-extractable portion of this entry used by the compaction
    /// token estimator.
    pub fn estimable_text(&self) -> String {
        match &self.kind {
            EntryKind::Message { message } => message.estimable_text(),
            EntryKind::CustomMessage { content, .. } => {
                content.as_ref().map(CustomContent::estimable_text).unwrap_or_default()
            }
            EntryKind::ModelChange { .. } | EntryKind::Summary { .. } => String::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            EntryKind::Message { .. } => "message",
            EntryKind::CustomMessage { .. } => "custom_message",
            EntryKind::ModelChange { .. } => "model_change",
            EntryKind::Summary { .. } => "summary",
        }
    }
}
