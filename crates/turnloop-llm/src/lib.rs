//! The `StreamFn` contract: the seam between the session core and whatever
//! concrete LLM wire protocol a caller plugs in.

pub mod adapters;
pub mod error;
pub mod provider;
pub mod request;
pub mod retry;
pub mod stream;

pub use error::{LlmError, LlmResult, WireErrorKind};
pub use provider::{LlmStream, StreamFn, StreamOptions};
pub use request::{ModelDescriptor, RequestContext, ToolDefinition};
pub use retry::RetryPolicy;
pub use stream::{PartialToolCall, StreamEvent, ToolCall};
