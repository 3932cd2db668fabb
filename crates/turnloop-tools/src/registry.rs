//! The `Tool` contract and the registry that looks tools up by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use turnloop_core::{AbortSignal, ContentBlock};

/// A progress update a long-running tool emits via `on_update` mid-execution.
/// Does not finalize the call — the executor still awaits a terminal
/// [`ToolOutcome`] afterwards.
#[derive(Debug, Clone)]
pub struct ToolUpdate {
    pub content: Vec<ContentBlock>,
    pub details: Option<Value>,
}

impl ToolUpdate {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(s)],
            details: None,
        }
    }
}

/// Callback a tool's `execute` uses to publish zero or more progress updates
/// before returning its terminal [`ToolOutcome`].
pub type OnUpdate = Arc<dyn Fn(ToolUpdate) + Send + Sync>;

/// The terminal result of one tool call.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success {
        content: Vec<ContentBlock>,
        details: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl ToolOutcome {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Success {
            content: vec![ContentBlock::text(s)],
            details: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The content blocks to carry into the `ToolResult` message, regardless
    /// of whether this outcome is a success or an error.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Success { content, .. } => content.clone(),
            Self::Error { message } => vec![ContentBlock::text(message.clone())],
        }
    }
}

/// Implement this to add a tool the agent loop can dispatch `ToolCall`
/// blocks to. Argument validation against [`Tool::parameters`] is the
/// tool's own responsibility; a schema-violating call should simply
/// return `ToolOutcome::Error`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model refers to this tool by.
    fn name(&self) -> &str;

    /// Short human-facing label, distinct from `name` (e.g. for UI display).
    fn label(&self) -> &str {
        self.name()
    }

    /// Description sent to the model alongside the schema.
    fn description(&self) -> &str;

    /// JSON-Schema object describing `arguments`.
    fn parameters(&self) -> Value;

    async fn execute(
        &self,
        call_id: &str,
        arguments: Value,
        abort: AbortSignal,
        on_update: OnUpdate,
    ) -> ToolOutcome;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registers a tool, replacing any existing registration under the same
    /// name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Tool schemas in the shape a `StreamFn` request wants. Kept here
    /// rather than depending on `turnloop-llm` directly so this crate stays
    /// usable without the LLM seam — callers map `(name, description,
    /// parameters)` into their own `ToolDefinition` type.
    pub fn schemas(&self) -> Vec<(String, String, Value)> {
        self.tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string(), t.parameters()))
            .collect()
    }
}
