//! Session identity and entry-id generation.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a session. Cheap to clone (wraps a `String` behind
/// an `Arc` would be premature here — sessions are long-lived and few, so a
/// plain owned `String` is simplest).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Monotonic, unique-within-process entry id generator for journal entries.
/// Ids only need to be unique within a single session's journal; a
/// per-journal counter prefixed with a short random tag keeps ids short and
/// legible in persisted files while still being safe to merge across
/// sessions created in the same process.
#[derive(Debug)]
pub struct EntryIdGenerator {
    prefix: String,
    next: std::sync::atomic::AtomicU64,
}

impl EntryIdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: Uuid::new_v4().simple().to_string()[..8].to_string(),
            next: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("e_{}_{n}", self.prefix)
    }
}

impl Default for EntryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
