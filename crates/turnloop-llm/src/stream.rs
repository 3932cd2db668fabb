//! The event taxonomy a `StreamFn` call produces.

use serde_json::Value;

use turnloop_core::{Message, StopReason, Usage};

use crate::error::WireErrorKind;

/// A partially-accumulated tool call, as seen mid-stream before its
/// arguments have finished arriving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON accumulated so far; may not yet parse as valid JSON.
    pub arguments_json: String,
}

impl PartialToolCall {
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.arguments_json).unwrap_or(Value::Object(Default::default()))
    }
}

/// A completed tool call as it will be stored in the Assistant entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One incremental event produced by a `StreamFn` call. `msg` fields carry a
/// running snapshot of the Assistant message under construction so
/// consumers never need to reassemble state themselves.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start {
        msg: Option<Message>,
    },
    TextStart {
        idx: usize,
    },
    TextDelta {
        idx: usize,
        chunk: String,
    },
    TextEnd {
        idx: usize,
    },
    ThinkingStart {
        idx: usize,
    },
    ThinkingDelta {
        idx: usize,
        chunk: String,
    },
    ThinkingEnd {
        idx: usize,
    },
    ToolCallStart {
        idx: usize,
        partial_tool_call: PartialToolCall,
    },
    ToolCallEnd {
        idx: usize,
        tool_call: ToolCall,
    },
    Usage {
        usage: Usage,
    },
    Done {
        stop_reason: StopReason,
        final_message: Message,
    },
    Error {
        kind: WireErrorKind,
        message: String,
    },
}
