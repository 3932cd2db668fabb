//! The table of named sub-agent "types" the coordinator can spawn.
//!
//! The core never discovers these from disk — per §1 that's the extension
//! loader's job. A caller builds a `SubagentCatalog` once, registering a
//! `SubagentTypeConfig` per named sub-agent it wants addressable by
//! `SubagentSpec::subagent`, plus a default used when a spec leaves the
//! field unset.

use std::collections::HashMap;
use std::sync::Arc;

use turnloop_agent::MessageCountBudget;
use turnloop_core::Settings;
use turnloop_llm::{ModelDescriptor, StreamFn};
use turnloop_tools::ToolRegistry;
use turnloop_core::ThinkingLevel;

/// Everything a coordinator needs to spawn a fresh `Session` for one kind
/// of sub-agent: its own model, tool surface and system prompt. Sub-agents
/// share the caller's cwd conceptually (callers bake cwd-specific tools
/// into `tools` themselves) but never share a journal.
#[derive(Clone)]
pub struct SubagentTypeConfig {
    pub model: ModelDescriptor,
    pub thinking_level: ThinkingLevel,
    pub system_prompt: Option<String>,
    pub context_window: u64,
    pub message_count_budget: Option<MessageCountBudget>,
    pub stream_fn: Arc<dyn StreamFn>,
    pub tools: Arc<ToolRegistry>,
    pub settings: Settings,
}

pub struct SubagentCatalog {
    types: HashMap<String, Arc<SubagentTypeConfig>>,
    default: Arc<SubagentTypeConfig>,
}

impl SubagentCatalog {
    pub fn new(default: SubagentTypeConfig) -> Self {
        Self {
            types: HashMap::new(),
            default: Arc::new(default),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, config: SubagentTypeConfig) {
        self.types.insert(name.into(), Arc::new(config));
    }

    /// Resolves the config for an optional subagent name. `None` falls back
    /// to the default type; `Some(name)` not present in the catalog is a
    /// lookup miss — the caller turns that into an `Unknown subagent` error
    /// result rather than silently falling back.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<SubagentTypeConfig>> {
        match name {
            None => Some(self.default.clone()),
            Some(n) => self.types.get(n).cloned(),
        }
    }
}
