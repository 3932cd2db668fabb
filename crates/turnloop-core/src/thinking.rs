//! Model-facing reasoning-effort hint.

use serde::{Deserialize, Serialize};

/// A model-facing reasoning-effort hint passed to `StreamFn`.
///
/// The two call sites that produce a `ThinkingLevel` disagree on what
/// "unset" should mean: parsing from a settings map with the key absent
/// historically yielded `Off`, while a freshly-constructed `Settings`
/// struct defaulted to `Medium`. Both are kept intentionally distinct here
/// (see `from_map_default` vs `impl Default`) rather than collapsed into
/// one constant, per the recorded decision in DESIGN.md.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ThinkingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    /// Resolves a `defaultThinkingLevel` settings value, returning `Off`
    /// when the key is absent or unrecognized — the map-parsing default
    /// named by the contract.
    pub fn from_map_default(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or(Self::Off)
    }
}

/// A freshly-constructed `Settings` defaults its thinking level to `Medium`,
/// distinct from `from_map_default`'s `Off` — both defaults are named by the
/// contract and neither may be silently unified.
impl Default for ThinkingLevel {
    fn default() -> Self {
        Self::Medium
    }
}
