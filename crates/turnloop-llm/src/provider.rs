//! The `StreamFn` contract the core consumes and never implements itself.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use turnloop_core::{AbortSignal, ThinkingLevel};

use crate::error::LlmResult;
use crate::request::{ModelDescriptor, RequestContext};
use crate::stream::StreamEvent;

pub type LlmStream = Pin<Box<dyn Stream<Item = LlmResult<StreamEvent>> + Send>>;

/// Options bundled alongside a model/context pair for one `StreamFn` call.
/// Bundling the abort signal here (rather than as a bare extra parameter)
/// keeps the call signature from drifting the way an earlier two-argument
/// form of this trait did — callers had stopped passing the second argument
/// in practice, leaving the signature and its call sites inconsistent.
#[derive(Clone)]
pub struct StreamOptions {
    pub abort_signal: AbortSignal,
    pub thinking_level: ThinkingLevel,
}

impl StreamOptions {
    pub fn new(abort_signal: AbortSignal, thinking_level: ThinkingLevel) -> Self {
        Self {
            abort_signal,
            thinking_level,
        }
    }
}

/// Given a model descriptor and a prepared request context, returns an
/// event stream. Concrete HTTP/SSE wiring is external to the core; this
/// trait is the seam.
#[async_trait]
pub trait StreamFn: Send + Sync {
    fn name(&self) -> &str;

    fn supports_model(&self, model_id: &str) -> bool;

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &RequestContext,
        opts: StreamOptions,
    ) -> LlmResult<LlmStream>;
}
