//! Core data model, error taxonomy, settings, and cancellation primitives
//! for the session/agent-loop runtime.

pub mod abort;
pub mod content;
pub mod entry;
pub mod error;
pub mod ids;
pub mod message;
pub mod settings;
pub mod thinking;

pub use abort::AbortSignal;
pub use content::{ContentBlock, ImageAttachment, StopReason, Usage};
pub use entry::{CustomContent, EntryKind, SessionEntry};
pub use error::{CoreError, ErrorKind, Result};
pub use ids::{EntryIdGenerator, SessionKey};
pub use message::{Message, UserContent};
pub use settings::{
    CompactionSettings, DefaultModel, ModelDescriptor, ProviderConfig, RetrySettings, Settings,
};
pub use thinking::ThinkingLevel;
