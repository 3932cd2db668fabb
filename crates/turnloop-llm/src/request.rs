//! The request context a turn builds and hands to `StreamFn`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use turnloop_core::Message;

/// Identifies which model/provider a turn should invoke. Distinct from
/// `turnloop_core::settings::ModelDescriptor`: that one is what a user
/// configures, this one is what a turn resolved and is about to call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub provider: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ModelDescriptor {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            base_url: None,
        }
    }
}

/// A tool schema advertised to the model in a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The fully-assembled input to one model call: system prompt, the live
/// branch rendered as messages, and the tools available this turn.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl RequestContext {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            system_prompt: None,
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}
