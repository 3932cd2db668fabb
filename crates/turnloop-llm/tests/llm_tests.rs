use async_trait::async_trait;
use futures::stream;

use turnloop_core::{AbortSignal, StopReason, ThinkingLevel, Usage};
use turnloop_llm::{
    LlmResult, LlmStream, ModelDescriptor, PartialToolCall, RequestContext, StreamEvent,
    StreamFn, StreamOptions, ToolCall,
};

// ====================================================================
// A scripted in-memory StreamFn, usable by any crate's tests.
// ====================================================================

pub struct ScriptedStreamFn {
    events: Vec<StreamEvent>,
}

impl ScriptedStreamFn {
    pub fn new(events: Vec<StreamEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl StreamFn for ScriptedStreamFn {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_model(&self, _model_id: &str) -> bool {
        true
    }

    async fn stream(
        &self,
        _model: &ModelDescriptor,
        _context: &RequestContext,
        _opts: StreamOptions,
    ) -> LlmResult<LlmStream> {
        let owned: Vec<LlmResult<StreamEvent>> =
            self.events.iter().cloned().map(Ok).collect();
        Ok(Box::pin(stream::iter(owned)))
    }
}

impl Clone for StreamEvent {
    fn clone(&self) -> Self {
        match self {
            Self::Start { msg } => Self::Start { msg: msg.clone() },
            Self::TextStart { idx } => Self::TextStart { idx: *idx },
            Self::TextDelta { idx, chunk } => Self::TextDelta { idx: *idx, chunk: chunk.clone() },
            Self::TextEnd { idx } => Self::TextEnd { idx: *idx },
            Self::ThinkingStart { idx } => Self::ThinkingStart { idx: *idx },
            Self::ThinkingDelta { idx, chunk } => Self::ThinkingDelta { idx: *idx, chunk: chunk.clone() },
            Self::ThinkingEnd { idx } => Self::ThinkingEnd { idx: *idx },
            Self::ToolCallStart { idx, partial_tool_call } => {
                Self::ToolCallStart { idx: *idx, partial_tool_call: partial_tool_call.clone() }
            }
            Self::ToolCallEnd { idx, tool_call } => Self::ToolCallEnd { idx: *idx, tool_call: tool_call.clone() },
            Self::Usage { usage } => Self::Usage { usage: *usage },
            Self::Done { stop_reason, final_message } => {
                Self::Done { stop_reason: *stop_reason, final_message: final_message.clone() }
            }
            Self::Error { kind, message } => Self::Error { kind: *kind, message: message.clone() },
        }
    }
}

// ====================================================================
// StreamFn fixture behavior
// ====================================================================

#[tokio::test]
async fn scripted_stream_fn_replays_events_in_order() {
    use futures::StreamExt;

    let fixture = ScriptedStreamFn::new(vec![
        StreamEvent::TextStart { idx: 0 },
        StreamEvent::TextDelta { idx: 0, chunk: "hi".into() },
        StreamEvent::Done {
            stop_reason: StopReason::Stop,
            final_message: turnloop_core::Message::assistant(
                vec![turnloop_core::ContentBlock::text("hi")],
                Some(StopReason::Stop),
                None,
                0,
            ),
        },
    ]);

    let ctx = RequestContext::new(vec![]);
    let model = ModelDescriptor::new("test", "test-model");
    let opts = StreamOptions::new(AbortSignal::new(), ThinkingLevel::Medium);
    let mut s = fixture.stream(&model, &ctx, opts).await.unwrap();

    let mut seen = Vec::new();
    while let Some(ev) = s.next().await {
        seen.push(ev.unwrap());
    }
    assert_eq!(seen.len(), 3);
    assert!(matches!(seen[0], StreamEvent::TextStart { idx: 0 }));
    assert!(matches!(seen[2], StreamEvent::Done { .. }));
}

// ====================================================================
// PartialToolCall
// ====================================================================

#[test]
fn partial_tool_call_parses_accumulated_json() {
    let partial = PartialToolCall {
        id: "c1".into(),
        name: "add".into(),
        arguments_json: r#"{"a":1,"b":2}"#.into(),
    };
    let parsed = partial.parsed_arguments();
    assert_eq!(parsed["a"], 1);
}

#[test]
fn partial_tool_call_falls_back_to_empty_object_on_invalid_json() {
    let partial = PartialToolCall {
        id: "c1".into(),
        name: "add".into(),
        arguments_json: "not json".into(),
    };
    let parsed = partial.parsed_arguments();
    assert!(parsed.is_object());
    assert_eq!(parsed.as_object().unwrap().len(), 0);
}

#[test]
fn tool_call_carries_resolved_arguments() {
    let call = ToolCall {
        id: "c1".into(),
        name: "add".into(),
        arguments: serde_json::json!({"a": 1}),
    };
    assert_eq!(call.arguments["a"], 1);
}

// ====================================================================
// Usage merge semantics
// ====================================================================

#[test]
fn usage_merge_latest_replaces_entirely() {
    let mut u = Usage { input: 1, output: 1, ..Default::default() };
    u.merge_latest(Usage { input: 5, output: 0, cache_read: 2, cache_write: 0, total_tokens: None });
    assert_eq!(u.input, 5);
    assert_eq!(u.total(), 7);
}
