//! The in-memory settings data model and its merge semantics.
//!
//! This is deliberately just a data model: deserialization and a pure
//! `merge` function. Discovering a settings file on disk, parsing a
//! specific file format, and any CLI surface for it are out of scope —
//! callers hand the core two already-deserialized [`Settings`] values.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::thinking::ThinkingLevel;

fn default_reserve_tokens() -> u64 {
    16_384
}

fn default_keep_recent_tokens() -> u64 {
    20_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

/// A `{provider, modelId, baseUrl?}` triple, or parsed from the shorthand
/// string form `"<provider>:<modelId>"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub provider: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ModelDescriptor {
    pub fn parse_shorthand(s: &str) -> Option<Self> {
        let (provider, model_id) = s.split_once(':')?;
        Some(Self {
            provider: provider.to_string(),
            model_id: model_id.to_string(),
            base_url: None,
        })
    }
}

/// Accepts either the structured form or the `"provider:modelId"` shorthand
/// string on input; always serializes structured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DefaultModel {
    Structured(ModelDescriptor),
    Shorthand(String),
}

impl DefaultModel {
    pub fn resolve(&self) -> Option<ModelDescriptor> {
        match self {
            Self::Structured(m) => Some(m.clone()),
            Self::Shorthand(s) => ModelDescriptor::parse_shorthand(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CompactionSettings {
    /// `None` means "absent", distinct from `Some(false)` — the boolean
    /// `||`-default idiom this replaces loses that distinction.
    #[serde(default)]
    pub compaction_enabled: Option<bool>,
    #[serde(default)]
    pub reserve_tokens: Option<u64>,
    #[serde(default)]
    pub keep_recent_tokens: Option<u64>,
}

impl CompactionSettings {
    pub fn enabled(&self) -> bool {
        self.compaction_enabled.unwrap_or(true)
    }

    pub fn reserve_tokens(&self) -> u64 {
        self.reserve_tokens.unwrap_or_else(default_reserve_tokens)
    }

    pub fn keep_recent_tokens(&self) -> u64 {
        self.keep_recent_tokens.unwrap_or_else(default_keep_recent_tokens)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    #[serde(default)]
    pub retry_enabled: Option<bool>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retry_enabled: None,
            max_retries: None,
            base_delay_ms: None,
        }
    }
}

impl RetrySettings {
    pub fn enabled(&self) -> bool {
        self.retry_enabled.unwrap_or(true)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or_else(default_max_retries)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms.unwrap_or_else(default_base_delay_ms)
    }
}

fn default_theme() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<DefaultModel>,
    #[serde(default)]
    pub scoped_models: Vec<ModelDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_thinking_level: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(flatten)]
    pub compaction: CompactionSettings,
    #[serde(flatten)]
    pub retry: RetrySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_prefix: Option<String>,
    /// `None` means "absent", distinct from `Some(false)` — same rationale
    /// as `CompactionSettings`/`RetrySettings`.
    #[serde(default)]
    pub auto_resize_images: Option<bool>,
    #[serde(default)]
    pub extension_paths: Vec<String>,
    #[serde(default)]
    pub theme: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_model: None,
            scoped_models: Vec::new(),
            default_thinking_level: None,
            providers: HashMap::new(),
            compaction: CompactionSettings::default(),
            retry: RetrySettings::default(),
            shell_path: None,
            command_prefix: None,
            auto_resize_images: None,
            extension_paths: Vec::new(),
            theme: None,
        }
    }
}

impl Settings {
    pub fn thinking_level(&self) -> ThinkingLevel {
        ThinkingLevel::from_map_default(self.default_thinking_level.as_deref())
    }

    pub fn auto_resize_images(&self) -> bool {
        self.auto_resize_images.unwrap_or(true)
    }

    pub fn theme(&self) -> String {
        self.theme.clone().unwrap_or_else(default_theme)
    }

    /// Merges `project` on top of `global`: scalars take the project value
    /// when present, list fields (`extensionPaths`, `scopedModels`) are
    /// concatenated global-then-project, and the `providers` map is
    /// shallow-merged with project keys overriding global ones of the same
    /// name.
    pub fn merge(global: &Settings, project: &Settings) -> Settings {
        let mut scoped_models = global.scoped_models.clone();
        scoped_models.extend(project.scoped_models.clone());

        let mut extension_paths = global.extension_paths.clone();
        extension_paths.extend(project.extension_paths.clone());

        let mut providers = global.providers.clone();
        for (name, cfg) in &project.providers {
            providers.insert(name.clone(), cfg.clone());
        }

        Settings {
            default_model: project.default_model.clone().or_else(|| global.default_model.clone()),
            scoped_models,
            default_thinking_level: project
                .default_thinking_level
                .clone()
                .or_else(|| global.default_thinking_level.clone()),
            providers,
            compaction: CompactionSettings {
                compaction_enabled: project
                    .compaction
                    .compaction_enabled
                    .or(global.compaction.compaction_enabled),
                reserve_tokens: project.compaction.reserve_tokens.or(global.compaction.reserve_tokens),
                keep_recent_tokens: project
                    .compaction
                    .keep_recent_tokens
                    .or(global.compaction.keep_recent_tokens),
            },
            retry: RetrySettings {
                retry_enabled: project.retry.retry_enabled.or(global.retry.retry_enabled),
                max_retries: project.retry.max_retries.or(global.retry.max_retries),
                base_delay_ms: project.retry.base_delay_ms.or(global.retry.base_delay_ms),
            },
            shell_path: project.shell_path.clone().or_else(|| global.shell_path.clone()),
            command_prefix: project
                .command_prefix
                .clone()
                .or_else(|| global.command_prefix.clone()),
            auto_resize_images: project.auto_resize_images.or(global.auto_resize_images),
            extension_paths,
            theme: project.theme.clone().or_else(|| global.theme.clone()),
        }
    }
}
