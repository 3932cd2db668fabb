use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use turnloop_agent::{spawn_session, LoopState, SessionConfig, SessionEvent};
use turnloop_core::{AbortSignal, ContentBlock, Message, Settings, StopReason, ThinkingLevel};
use turnloop_llm::{
    LlmResult, LlmStream, ModelDescriptor, PartialToolCall, RequestContext, StreamEvent, StreamFn, StreamOptions, ToolCall,
};
use turnloop_tools::{OnUpdate, Tool, ToolOutcome, ToolRegistry, ToolUpdate};

// =========================================================================
// A scripted StreamFn: each call consumes the next script in sequence and
// replays the fixed one after that, so a multi-turn test (prompt -> tool
// call -> final text) can script exactly what each of the loop's LLM
// invocations returns.
// =========================================================================

struct ScriptedStreamFn {
    scripts: Vec<Vec<StreamEvent>>,
    call_count: AtomicUsize,
}

impl ScriptedStreamFn {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self { scripts, call_count: AtomicUsize::new(0) }
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

    async fn stream(&self, _model: &ModelDescriptor, _context: &RequestContext, _opts: StreamOptions) -> LlmResult<LlmStream> {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.get(call).or_else(|| self.scripts.last()).cloned().unwrap_or_default();
        let owned: Vec<LlmResult<StreamEvent>> = script.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(owned)))
    }
}

/// Same script-replay behaviour as `ScriptedStreamFn`, but holds briefly
/// before emitting anything so a command sent right after `prompt()` is
/// guaranteed to land on the actor while the turn is still streaming.
struct DelayedScriptedStreamFn {
    inner: ScriptedStreamFn,
    delay: Duration,
}

#[async_trait]
impl StreamFn for DelayedScriptedStreamFn {
    fn name(&self) -> &str {
        "delayed-scripted"
    }

    fn supports_model(&self, _model_id: &str) -> bool {
        true
    }

    async fn stream(&self, model: &ModelDescriptor, context: &RequestContext, opts: StreamOptions) -> LlmResult<LlmStream> {
        tokio::time::sleep(self.delay).await;
        self.inner.stream(model, context, opts).await
    }
}

fn text_reply(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextStart { idx: 0 },
        StreamEvent::TextDelta { idx: 0, chunk: text.to_string() },
        StreamEvent::TextEnd { idx: 0 },
        StreamEvent::Done {
            stop_reason: StopReason::Stop,
            final_message: Message::assistant(vec![ContentBlock::text(text)], Some(StopReason::Stop), None, 0),
        },
    ]
}

fn tool_call_reply(call_id: &str, name: &str, args: Value) -> Vec<StreamEvent> {
    let tool_call = ToolCall { id: call_id.to_string(), name: name.to_string(), arguments: args.clone() };
    vec![
        StreamEvent::ToolCallStart {
            idx: 0,
            partial_tool_call: PartialToolCall { id: call_id.to_string(), name: name.to_string(), arguments_json: args.to_string() },
        },
        StreamEvent::ToolCallEnd { idx: 0, tool_call: tool_call.clone() },
        StreamEvent::Done {
            stop_reason: StopReason::ToolUse,
            final_message: Message::assistant(
                vec![ContentBlock::tool_call(call_id, name, args)],
                Some(StopReason::ToolUse),
                None,
                0,
            ),
        },
    ]
}

// A tool that sleeps cooperatively, checking abort every 20ms — the fixture
// scenario 5 of the contract's testable-properties section describes.
struct SleeperTool;

#[async_trait]
impl Tool for SleeperTool {
    fn name(&self) -> &str {
        "sleeper"
    }
    fn description(&self) -> &str {
        "sleeps until aborted"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _call_id: &str, _arguments: Value, abort: AbortSignal, _on_update: OnUpdate) -> ToolOutcome {
        loop {
            if abort.is_aborted() {
                return ToolOutcome::error("aborted");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

// A tool that takes a fixed, non-trivial amount of time to finish (not
// cooperative-abort polling, just slow) so a steer sent right after
// `ToolExecutionStart` is guaranteed to land while the tool is still running.
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "takes a while"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _call_id: &str, _arguments: Value, _abort: AbortSignal, _on_update: OnUpdate) -> ToolOutcome {
        tokio::time::sleep(Duration::from_millis(100)).await;
        ToolOutcome::text("ok")
    }
}

struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }
    fn description(&self) -> &str {
        "adds two numbers"
    }
    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(&self, _call_id: &str, arguments: Value, _abort: AbortSignal, _on_update: OnUpdate) -> ToolOutcome {
        let a = arguments.get("a").and_then(Value::as_f64).unwrap_or(0.0);
        let b = arguments.get("b").and_then(Value::as_f64).unwrap_or(0.0);
        ToolOutcome::text((a + b).to_string())
    }
}

fn base_config(stream_fn: Arc<dyn StreamFn>, tools: ToolRegistry) -> SessionConfig {
    SessionConfig {
        session_id: None,
        settings: Settings::default(),
        model: ModelDescriptor::new("test", "test-model"),
        thinking_level: ThinkingLevel::Off,
        system_prompt: None,
        context_window: 1_000_000,
        message_count_budget: None,
        stream_fn,
        tools: Arc::new(tools),
    }
}

// =========================================================================
// Scenario 1: simple turn
// =========================================================================

#[tokio::test]
async fn simple_turn_emits_full_event_sequence_and_two_entries() {
    let stream_fn = Arc::new(ScriptedStreamFn::new(vec![text_reply("hello")]));
    let (handle, _join) = spawn_session(base_config(stream_fn, ToolRegistry::new()));

    let mut mailbox = handle.subscribe_mailbox(64).await.unwrap();
    handle.prompt("hi").await.unwrap();

    let mut kinds = Vec::new();
    loop {
        let envelope = mailbox.recv().await.unwrap();
        let is_end = matches!(envelope.event, SessionEvent::AgentEnd { .. });
        kinds.push(event_kind(&envelope.event));
        if is_end {
            break;
        }
    }

    assert_eq!(kinds.first(), Some(&"agent_start"));
    assert_eq!(kinds.last(), Some(&"agent_end"));
    assert!(kinds.contains(&"turn_start"));
    assert!(kinds.contains(&"message_start"));
    assert!(kinds.contains(&"message_end"));
    assert!(kinds.contains(&"turn_end"));
    assert!(!kinds.contains(&"tool_execution_start"));

    let messages = handle.get_messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(handle.get_state().await, LoopState::Idle);
}

// =========================================================================
// Scenario 2: tool turn then final
// =========================================================================

#[tokio::test]
async fn tool_call_then_final_text_appends_four_entries() {
    let stream_fn = Arc::new(ScriptedStreamFn::new(vec![
        tool_call_reply("c1", "add", serde_json::json!({"a": 5, "b": 3})),
        text_reply("8"),
    ]));
    let mut tools = ToolRegistry::new();
    tools.register(AddTool);
    let (handle, _join) = spawn_session(base_config(stream_fn, tools));

    let mut mailbox = handle.subscribe_mailbox(64).await.unwrap();
    handle.prompt("add 5 and 3").await.unwrap();

    let mut saw_tool_start = false;
    let mut saw_tool_end = false;
    loop {
        let envelope = mailbox.recv().await.unwrap();
        match envelope.event {
            SessionEvent::ToolExecutionStart { ref call_id, ref name, .. } => {
                assert_eq!(call_id, "c1");
                assert_eq!(name, "add");
                saw_tool_start = true;
            }
            SessionEvent::ToolExecutionEnd { ref call_id, is_error, .. } => {
                assert_eq!(call_id, "c1");
                assert!(!is_error);
                saw_tool_end = true;
            }
            SessionEvent::AgentEnd { .. } => break,
            _ => {}
        }
    }

    assert!(saw_tool_start);
    assert!(saw_tool_end);

    let messages = handle.get_messages().await;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].role_name(), "user");
    assert_eq!(messages[1].role_name(), "assistant");
    assert_eq!(messages[2].role_name(), "tool_result");
    assert_eq!(messages[3].role_name(), "assistant");
}

// =========================================================================
// Steer arrives while a tool is still executing: must be appended between
// the tool result and the next LLM invocation, not dropped/delayed until
// some later non-tool-use turn end.
// =========================================================================

#[tokio::test]
async fn steer_during_tool_execution_is_injected_before_next_turn() {
    let stream_fn = Arc::new(ScriptedStreamFn::new(vec![tool_call_reply("c1", "slow", Value::Null), text_reply("done")]));
    let mut tools = ToolRegistry::new();
    tools.register(SlowTool);
    let (handle, _join) = spawn_session(base_config(stream_fn, tools));

    let mut mailbox = handle.subscribe_mailbox(64).await.unwrap();
    handle.prompt("start").await.unwrap();

    loop {
        if let SessionEvent::ToolExecutionStart { .. } = mailbox.recv().await.unwrap().event {
            break;
        }
    }
    handle.steer("extra instruction").await.unwrap();

    loop {
        if let SessionEvent::AgentEnd { .. } = mailbox.recv().await.unwrap().event {
            break;
        }
    }

    let messages = handle.get_messages().await;
    // user "start", assistant(tool call), tool_result, user "extra instruction", assistant "done"
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[2].role_name(), "tool_result");
    assert_eq!(messages[3].role_name(), "user");
    assert_eq!(messages[3].estimable_text(), "extra instruction");
    assert_eq!(messages[4].role_name(), "assistant");
}

// =========================================================================
// Scenario 5: abort mid-tool
// =========================================================================

#[tokio::test]
async fn abort_mid_tool_execution_returns_to_idle_within_bound() {
    let stream_fn = Arc::new(ScriptedStreamFn::new(vec![tool_call_reply("c1", "sleeper", Value::Null)]));
    let mut tools = ToolRegistry::new();
    tools.register(SleeperTool);
    let (handle, _join) = spawn_session(base_config(stream_fn, tools));

    let mut mailbox = handle.subscribe_mailbox(64).await.unwrap();
    handle.prompt("stall").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match mailbox.recv().await.unwrap().event {
                SessionEvent::ToolExecutionEnd { is_error, content, .. } => {
                    let text: String = content.iter().filter_map(|b| b.estimable_text()).collect();
                    return (is_error, text);
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("tool_execution_end within bound");

    assert!(outcome.0);
    assert!(outcome.1.contains("aborted"));

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if handle.get_state().await == LoopState::Idle && !handle.health_check().await.is_streaming {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session returns to idle within bound");

    // subsequent prompt succeeds
    assert!(handle.prompt("are you there").await.is_ok());
}

// =========================================================================
// Scenario 6: steer during streaming
// =========================================================================

#[tokio::test]
async fn steer_during_streaming_starts_a_second_turn_without_extra_agent_end() {
    let stream_fn = Arc::new(DelayedScriptedStreamFn {
        inner: ScriptedStreamFn::new(vec![text_reply("first"), text_reply("second")]),
        delay: Duration::from_millis(80),
    });
    let (handle, _join) = spawn_session(base_config(stream_fn, ToolRegistry::new()));

    let mut mailbox = handle.subscribe_mailbox(64).await.unwrap();
    handle.prompt("q1").await.unwrap();
    handle.steer("also consider X").await.unwrap();

    let mut turn_starts = 0;
    let mut agent_ends = 0;
    loop {
        let envelope = mailbox.recv().await.unwrap();
        match envelope.event {
            SessionEvent::TurnStart => turn_starts += 1,
            SessionEvent::AgentEnd { .. } => {
                agent_ends += 1;
                break;
            }
            _ => {}
        }
    }

    assert_eq!(turn_starts, 2);
    assert_eq!(agent_ends, 1);

    let messages = handle.get_messages().await;
    // user q1, assistant "first", user steer, assistant "second"
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role_name(), "user");
}

fn event_kind(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::AgentStart => "agent_start",
        SessionEvent::TurnStart => "turn_start",
        SessionEvent::MessageStart { .. } => "message_start",
        SessionEvent::MessageUpdate { .. } => "message_update",
        SessionEvent::MessageEnd { .. } => "message_end",
        SessionEvent::ToolExecutionStart { .. } => "tool_execution_start",
        SessionEvent::ToolExecutionUpdate { .. } => "tool_execution_update",
        SessionEvent::ToolExecutionEnd { .. } => "tool_execution_end",
        SessionEvent::TurnEnd { .. } => "turn_end",
        SessionEvent::AgentEnd { .. } => "agent_end",
        SessionEvent::Error { .. } => "error",
        SessionEvent::Canceled { .. } => "canceled",
    }
}
