//! The single-writer session actor: owns the journal and drives turns.
//!
//! Mirrors a long-lived task that serves a command channel, with
//! background tasks doing the actual LLM streaming and tool dispatch and
//! reporting their outcome back over an internal channel so the actor
//! remains the only mutator of its own state.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use turnloop_core::{
    AbortSignal, CoreError, EntryKind, ErrorKind, ImageAttachment, Message, Result, Settings, StopReason, ThinkingLevel, Usage,
};
use turnloop_llm::{ModelDescriptor, RequestContext, RetryPolicy, StreamEvent, StreamFn, StreamOptions, ToolDefinition};
use turnloop_tools::{ToolExecutionObserver, ToolExecutor, ToolOutcome, ToolRegistry, ToolUpdate};

use crate::compaction::{
    build_effective_context, estimate_request_context_tokens, run_compaction, should_compact, should_force_compact_by_message_count,
    CutPointOptions, MessageCountBudget,
};
use crate::events::{EventFanOut, MailboxSubscription, MessageDelta, SessionEvent, StreamSubscription};
use crate::journal::SessionJournal;

fn now_ts() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// A crude jitter source for retry backoff. Not cryptographically random —
/// just enough spread that concurrent sessions retrying the same failure
/// don't wake up in lockstep. No dependency on a `rand` crate, since
/// nothing else in this lineage pulls one in for this kind of use.
fn pseudo_random_unit() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos % 1_000_000) as f64 / 1_000_000.0
}

/// State of the turn driver. `Streaming` covers both an in-flight LLM call
/// and in-flight tool execution — both reject a new `prompt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Streaming,
    Aborting,
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub entry_count: usize,
    pub branch_length: usize,
    pub estimated_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub state: LoopState,
    pub current_request_id: Option<u64>,
    pub steer_queue_len: usize,
    pub follow_up_queue_len: usize,
    pub model: ModelDescriptor,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    pub is_streaming: bool,
}

/// Commands accepted over the actor's command channel. Every public
/// `SessionHandle` method is a thin wrapper sending one of these and
/// awaiting the paired response.
enum AgentCommand {
    Prompt {
        text: String,
        images: Vec<ImageAttachment>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Steer {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    FollowUp {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Abort {
        respond_to: oneshot::Sender<()>,
    },
    ResetTo {
        entry_id: Option<String>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Save {
        path: PathBuf,
        respond_to: oneshot::Sender<Result<()>>,
    },
    SwitchModel {
        model: ModelDescriptor,
        respond_to: oneshot::Sender<()>,
    },
    SetThinkingLevel {
        level: ThinkingLevel,
        respond_to: oneshot::Sender<()>,
    },
    GetState {
        respond_to: oneshot::Sender<LoopState>,
    },
    GetMessages {
        respond_to: oneshot::Sender<Vec<Message>>,
    },
    GetStats {
        respond_to: oneshot::Sender<SessionStats>,
    },
    Diagnostics {
        respond_to: oneshot::Sender<Diagnostics>,
    },
    HealthCheck {
        respond_to: oneshot::Sender<HealthStatus>,
    },
    SubscribeMailbox {
        max_queue: usize,
        respond_to: oneshot::Sender<MailboxSubscription>,
    },
    SubscribeStream {
        max_queue: usize,
        respond_to: oneshot::Sender<StreamSubscription>,
    },
}

/// The outcome of one background LLM streaming attempt, reported back to
/// the actor over the internal channel.
enum StreamOutcome {
    Completed { message: Message },
    Aborted { partial_message: Message },
    Failed { kind: turnloop_llm::WireErrorKind, message: String, partial_message: Message },
}

enum TurnInternalEvent {
    StreamDone { request_id: u64, outcome: StreamOutcome },
    ToolBatchDone { request_id: u64, results: Vec<(String, ToolOutcome)> },
}

/// Configuration handed to `spawn_session`.
pub struct SessionConfig {
    pub session_id: Option<String>,
    pub settings: Settings,
    pub model: ModelDescriptor,
    pub thinking_level: ThinkingLevel,
    pub system_prompt: Option<String>,
    pub context_window: u64,
    pub message_count_budget: Option<MessageCountBudget>,
    pub stream_fn: Arc<dyn StreamFn>,
    pub tools: Arc<ToolRegistry>,
}

/// A cheaply-cloneable handle to a running session actor. Every method
/// forwards a command over the channel and awaits its acknowledgement —
/// the single-writer invariant lives entirely on the actor side.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<AgentCommand>,
}

impl SessionHandle {
    pub async fn prompt(&self, text: impl Into<String>) -> Result<()> {
        self.prompt_with_images(text, Vec::new()).await
    }

    pub async fn prompt_with_images(&self, text: impl Into<String>, images: Vec<ImageAttachment>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::Prompt { text: text.into(), images, respond_to }).await;
        rx.await.unwrap_or_else(|_| Err(CoreError::Internal("session actor dropped".into())))
    }

    pub async fn steer(&self, text: impl Into<String>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::Steer { text: text.into(), respond_to }).await;
        rx.await.unwrap_or_else(|_| Err(CoreError::Internal("session actor dropped".into())))
    }

    pub async fn follow_up(&self, text: impl Into<String>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::FollowUp { text: text.into(), respond_to }).await;
        rx.await.unwrap_or_else(|_| Err(CoreError::Internal("session actor dropped".into())))
    }

    pub async fn abort(&self) {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::Abort { respond_to }).await;
        let _ = rx.await;
    }

    pub async fn reset_to(&self, entry_id: Option<String>) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::ResetTo { entry_id, respond_to }).await;
        rx.await.unwrap_or_else(|_| Err(CoreError::Internal("session actor dropped".into())))
    }

    pub async fn save(&self, path: PathBuf) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::Save { path, respond_to }).await;
        rx.await.unwrap_or_else(|_| Err(CoreError::Internal("session actor dropped".into())))
    }

    pub async fn switch_model(&self, model: ModelDescriptor) {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::SwitchModel { model, respond_to }).await;
        let _ = rx.await;
    }

    pub async fn set_thinking_level(&self, level: ThinkingLevel) {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::SetThinkingLevel { level, respond_to }).await;
        let _ = rx.await;
    }

    pub async fn get_state(&self) -> LoopState {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::GetState { respond_to }).await;
        rx.await.unwrap_or(LoopState::Idle)
    }

    pub async fn get_messages(&self) -> Vec<Message> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::GetMessages { respond_to }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn get_stats(&self) -> SessionStats {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::GetStats { respond_to }).await;
        rx.await.unwrap_or(SessionStats { entry_count: 0, branch_length: 0, estimated_tokens: 0 })
    }

    pub async fn diagnostics(&self) -> Option<Diagnostics> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::Diagnostics { respond_to }).await;
        rx.await.ok()
    }

    pub async fn health_check(&self) -> HealthStatus {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::HealthCheck { respond_to }).await;
        rx.await.unwrap_or(HealthStatus { is_streaming: false })
    }

    pub async fn subscribe_mailbox(&self, max_queue: usize) -> Option<MailboxSubscription> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::SubscribeMailbox { max_queue, respond_to }).await;
        rx.await.ok()
    }

    pub async fn subscribe_stream(&self, max_queue: usize) -> Option<StreamSubscription> {
        let (respond_to, rx) = oneshot::channel();
        self.send(AgentCommand::SubscribeStream { max_queue, respond_to }).await;
        rx.await.ok()
    }

    async fn send(&self, cmd: AgentCommand) {
        let _ = self.tx.send(cmd).await;
    }
}

struct FanOutToolObserver {
    fan_out: Arc<EventFanOut>,
}

impl ToolExecutionObserver for FanOutToolObserver {
    fn on_start(&self, call_id: &str, name: &str, arguments: &Value) {
        self.fan_out.publish(SessionEvent::ToolExecutionStart {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments: arguments.clone(),
        });
    }

    fn on_update(&self, call_id: &str, update: &ToolUpdate) {
        self.fan_out.publish(SessionEvent::ToolExecutionUpdate {
            call_id: call_id.to_string(),
            content: update.content.clone(),
            details: update.details.clone(),
        });
    }

    fn on_end(&self, call_id: &str, name: &str, outcome: &ToolOutcome) {
        self.fan_out.publish(SessionEvent::ToolExecutionEnd {
            call_id: call_id.to_string(),
            name: name.to_string(),
            is_error: outcome.is_error(),
            content: outcome.content_blocks(),
        });
    }
}

fn set_block(blocks: &mut Vec<turnloop_core::ContentBlock>, idx: usize, block: turnloop_core::ContentBlock) {
    while blocks.len() <= idx {
        blocks.push(turnloop_core::ContentBlock::text(String::new()));
    }
    blocks[idx] = block;
}

fn append_text(blocks: &mut Vec<turnloop_core::ContentBlock>, idx: usize, chunk: &str) {
    while blocks.len() <= idx {
        blocks.push(turnloop_core::ContentBlock::text(String::new()));
    }
    match &mut blocks[idx] {
        turnloop_core::ContentBlock::Text { text } => text.push_str(chunk),
        slot => *slot = turnloop_core::ContentBlock::text(chunk),
    }
}

fn append_thinking(blocks: &mut Vec<turnloop_core::ContentBlock>, idx: usize, chunk: &str) {
    while blocks.len() <= idx {
        blocks.push(turnloop_core::ContentBlock::thinking(String::new()));
    }
    match &mut blocks[idx] {
        turnloop_core::ContentBlock::Thinking { text } => text.push_str(chunk),
        slot => *slot = turnloop_core::ContentBlock::thinking(chunk),
    }
}

fn assemble_message(blocks: &[turnloop_core::ContentBlock], stop_reason: Option<StopReason>, usage: Option<Usage>) -> Message {
    Message::assistant(blocks.to_vec(), stop_reason, usage, now_ts())
}

fn force_stop_reason(message: Message, stop_reason: StopReason, ts: i64) -> Message {
    match message {
        Message::Assistant { content, usage, .. } => Message::assistant(content, Some(stop_reason), usage, ts),
        other => other,
    }
}

/// Consumes one `StreamFn` call to completion (retrying the initial
/// request per `retry_policy` on a retryable failure), publishing
/// fine-grained `MessageUpdate` deltas to `fan_out` as they arrive. Safe to
/// run on a background task since `EventFanOut` and `AbortSignal` are both
/// `Send + Sync`.
#[allow(clippy::too_many_arguments)]
async fn run_llm_turn(
    stream_fn: &dyn StreamFn,
    model: &ModelDescriptor,
    context: &RequestContext,
    thinking_level: ThinkingLevel,
    retry_policy: &RetryPolicy,
    abort: &AbortSignal,
    fan_out: &EventFanOut,
) -> StreamOutcome {
    let mut attempt: u32 = 0;

    let mut stream = loop {
        let opts = StreamOptions::new(abort.child(), thinking_level);
        match stream_fn.stream(model, context, opts).await {
            Ok(stream) => break stream,
            Err(e) => {
                let kind = e.wire_kind();
                if retry_policy.should_retry(attempt, kind) {
                    let delay_ms = retry_policy.backoff_delay_ms(attempt, pseudo_random_unit());
                    tracing::warn!(attempt, wire_kind = kind.as_str(), delay_ms, "retrying stream_fn call after failure");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                        _ = abort.cancelled() => {
                            return StreamOutcome::Aborted { partial_message: assemble_message(&[], None, None) };
                        }
                    }
                    attempt += 1;
                    continue;
                }
                return StreamOutcome::Failed {
                    kind,
                    message: e.to_string(),
                    partial_message: assemble_message(&[], None, None),
                };
            }
        }
    };

    let mut content: Vec<turnloop_core::ContentBlock> = Vec::new();
    let mut usage: Option<Usage> = None;

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        if abort.is_aborted() {
                            return StreamOutcome::Aborted { partial_message: assemble_message(&content, None, usage) };
                        }
                        match event {
                            StreamEvent::Start { .. } => {}
                            StreamEvent::TextStart { idx } => {
                                set_block(&mut content, idx, turnloop_core::ContentBlock::text(String::new()));
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::TextStart { idx },
                                });
                            }
                            StreamEvent::TextDelta { idx, chunk } => {
                                append_text(&mut content, idx, &chunk);
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::TextDelta { idx, chunk },
                                });
                            }
                            StreamEvent::TextEnd { idx } => {
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::TextEnd { idx },
                                });
                            }
                            StreamEvent::ThinkingStart { idx } => {
                                set_block(&mut content, idx, turnloop_core::ContentBlock::thinking(String::new()));
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::ThinkingStart { idx },
                                });
                            }
                            StreamEvent::ThinkingDelta { idx, chunk } => {
                                append_thinking(&mut content, idx, &chunk);
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::ThinkingDelta { idx, chunk },
                                });
                            }
                            StreamEvent::ThinkingEnd { idx } => {
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::ThinkingEnd { idx },
                                });
                            }
                            StreamEvent::ToolCallStart { idx, partial_tool_call } => {
                                set_block(
                                    &mut content,
                                    idx,
                                    turnloop_core::ContentBlock::tool_call(
                                        partial_tool_call.id.clone(),
                                        partial_tool_call.name.clone(),
                                        partial_tool_call.parsed_arguments(),
                                    ),
                                );
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::ToolCallStart { idx, partial_tool_call },
                                });
                            }
                            StreamEvent::ToolCallEnd { idx, tool_call } => {
                                set_block(
                                    &mut content,
                                    idx,
                                    turnloop_core::ContentBlock::tool_call(tool_call.id.clone(), tool_call.name.clone(), tool_call.arguments.clone()),
                                );
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::ToolCallEnd { idx, tool_call },
                                });
                            }
                            StreamEvent::Usage { usage: incoming } => {
                                usage = Some(match usage.take() {
                                    Some(mut prev) => {
                                        prev.merge_latest(incoming.clone());
                                        prev
                                    }
                                    None => incoming.clone(),
                                });
                                fan_out.publish(SessionEvent::MessageUpdate {
                                    message: assemble_message(&content, None, usage.clone()),
                                    delta: MessageDelta::Usage { usage: incoming },
                                });
                            }
                            StreamEvent::Done { final_message, .. } => {
                                return StreamOutcome::Completed { message: final_message };
                            }
                            StreamEvent::Error { kind, message } => {
                                return StreamOutcome::Failed {
                                    kind,
                                    message,
                                    partial_message: assemble_message(&content, None, usage),
                                };
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let kind = e.wire_kind();
                        return StreamOutcome::Failed { kind, message: e.to_string(), partial_message: assemble_message(&content, None, usage) };
                    }
                    None => {
                        return StreamOutcome::Completed { message: assemble_message(&content, Some(StopReason::Stop), usage) };
                    }
                }
            }
            _ = abort.cancelled() => {
                return StreamOutcome::Aborted { partial_message: assemble_message(&content, None, usage) };
            }
        }
    }
}

struct SessionActor {
    session_id: String,
    journal: SessionJournal,
    settings: Settings,
    system_prompt: Option<String>,
    model: ModelDescriptor,
    thinking_level: ThinkingLevel,
    context_window: u64,
    message_count_budget: Option<MessageCountBudget>,
    stream_fn: Arc<dyn StreamFn>,
    tools: Arc<ToolRegistry>,
    fan_out: Arc<EventFanOut>,
    state: LoopState,
    abort_signal: Option<AbortSignal>,
    current_request_id: Option<u64>,
    next_request_id: u64,
    steer_queue: VecDeque<String>,
    follow_up_queue: VecDeque<String>,
    commands_rx: mpsc::Receiver<AgentCommand>,
    internal_rx: mpsc::Receiver<TurnInternalEvent>,
    internal_tx: mpsc::Sender<TurnInternalEvent>,
}

impl SessionActor {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = self.internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal(event).await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Prompt { text, images, respond_to } => {
                let result = self.cmd_prompt(text, images).await;
                let _ = respond_to.send(result);
            }
            AgentCommand::Steer { text, respond_to } => {
                let result = self.cmd_steer(text).await;
                let _ = respond_to.send(result);
            }
            AgentCommand::FollowUp { text, respond_to } => {
                self.follow_up_queue.push_back(text);
                let _ = respond_to.send(Ok(()));
            }
            AgentCommand::Abort { respond_to } => {
                self.cmd_abort();
                let _ = respond_to.send(());
            }
            AgentCommand::ResetTo { entry_id, respond_to } => {
                let result = self.journal.reset_head(entry_id);
                let _ = respond_to.send(result);
            }
            AgentCommand::Save { path, respond_to } => {
                let result = self.journal.save(&path).map_err(|e| {
                    tracing::warn!(error = %e, "journal save failed");
                    CoreError::persistence_failed(e.to_string())
                });
                let _ = respond_to.send(result);
            }
            AgentCommand::SwitchModel { model, respond_to } => {
                let ts = now_ts();
                self.journal.append(
                    EntryKind::ModelChange { provider: model.provider.clone(), model_id: model.model_id.clone() },
                    ts,
                );
                self.model = model;
                let _ = respond_to.send(());
            }
            AgentCommand::SetThinkingLevel { level, respond_to } => {
                self.thinking_level = level;
                let _ = respond_to.send(());
            }
            AgentCommand::GetState { respond_to } => {
                let _ = respond_to.send(self.state);
            }
            AgentCommand::GetMessages { respond_to } => {
                let _ = respond_to.send(self.current_messages());
            }
            AgentCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.compute_stats());
            }
            AgentCommand::Diagnostics { respond_to } => {
                let _ = respond_to.send(self.compute_diagnostics());
            }
            AgentCommand::HealthCheck { respond_to } => {
                let _ = respond_to.send(self.compute_health());
            }
            AgentCommand::SubscribeMailbox { max_queue, respond_to } => {
                let _ = respond_to.send(self.fan_out.subscribe_mailbox(max_queue));
            }
            AgentCommand::SubscribeStream { max_queue, respond_to } => {
                let _ = respond_to.send(self.fan_out.subscribe_stream(max_queue));
            }
        }
    }

    async fn handle_internal(&mut self, event: TurnInternalEvent) {
        match event {
            TurnInternalEvent::StreamDone { request_id, outcome } => self.handle_stream_done(request_id, outcome).await,
            TurnInternalEvent::ToolBatchDone { request_id, results } => self.handle_tool_batch_done(request_id, results).await,
        }
    }

    async fn cmd_prompt(&mut self, text: String, images: Vec<ImageAttachment>) -> Result<()> {
        if self.state != LoopState::Idle {
            return Err(CoreError::AlreadyStreaming);
        }
        let ts = now_ts();
        let message = Message::user_with_images(text, images, ts);
        self.journal.append(EntryKind::Message { message }, ts);
        self.fan_out.publish(SessionEvent::AgentStart);
        self.start_turn().await;
        Ok(())
    }

    async fn cmd_steer(&mut self, text: String) -> Result<()> {
        match self.state {
            LoopState::Idle => self.cmd_prompt(text, Vec::new()).await,
            LoopState::Streaming | LoopState::Aborting => {
                self.steer_queue.push_back(text);
                Ok(())
            }
        }
    }

    fn cmd_abort(&mut self) {
        if let Some(signal) = &self.abort_signal {
            signal.abort();
        }
        if self.state != LoopState::Idle {
            self.follow_up_queue.clear();
            self.state = LoopState::Aborting;
        }
    }

    fn current_messages(&self) -> Vec<Message> {
        self.journal.current_branch().into_iter().filter_map(|e| e.as_message().cloned()).collect()
    }

    fn compute_stats(&self) -> SessionStats {
        let branch = self.journal.current_branch();
        let messages: Vec<Message> = branch.iter().filter_map(|e| e.as_message().cloned()).collect();
        let estimated_tokens = estimate_request_context_tokens(&messages, self.system_prompt.as_deref(), &[]);
        SessionStats { entry_count: self.journal.len(), branch_length: branch.len(), estimated_tokens }
    }

    fn compute_diagnostics(&self) -> Diagnostics {
        Diagnostics {
            state: self.state,
            current_request_id: self.current_request_id,
            steer_queue_len: self.steer_queue.len(),
            follow_up_queue_len: self.follow_up_queue.len(),
            model: self.model.clone(),
        }
    }

    fn compute_health(&self) -> HealthStatus {
        HealthStatus { is_streaming: self.state != LoopState::Idle }
    }

    fn build_system_prompt(&self, summary_preamble: Option<&str>) -> Option<String> {
        match (&self.system_prompt, summary_preamble) {
            (Some(base), Some(preamble)) => Some(format!("{base}\n\nPrior conversation summary:\n{preamble}")),
            (Some(base), None) => Some(base.clone()),
            (None, Some(preamble)) => Some(format!("Prior conversation summary:\n{preamble}")),
            (None, None) => None,
        }
    }

    async fn maybe_compact(&mut self) {
        let compaction_outcome;
        {
            let branch = self.journal.current_branch();
            if branch.is_empty() {
                return;
            }
            let messages: Vec<Message> = branch.iter().filter_map(|e| e.as_message().cloned()).collect();
            let ctx_tokens = estimate_request_context_tokens(&messages, self.system_prompt.as_deref(), &[]);
            let live_message_count = messages.len() as u64;

            let token_triggered = should_compact(ctx_tokens, self.context_window, &self.settings.compaction);
            let count_triggered = should_force_compact_by_message_count(
                live_message_count,
                self.settings.compaction.enabled(),
                self.message_count_budget.as_ref(),
            );
            if !token_triggered && !count_triggered {
                return;
            }

            let cut_opts = CutPointOptions {
                keep_recent_messages: self.message_count_budget.as_ref().and_then(|b| b.keep_recent_messages),
                force: count_triggered && !token_triggered,
            };

            let abort = self.abort_signal.clone().unwrap_or_else(AbortSignal::new);
            compaction_outcome = run_compaction(
                &branch,
                self.settings.compaction.keep_recent_tokens(),
                &cut_opts,
                None,
                self.stream_fn.as_ref(),
                &self.model,
                self.thinking_level,
                &abort,
            )
            .await;
        }

        match compaction_outcome {
            Ok(outcome) => {
                let ts = now_ts();
                let entries_summarized = outcome.entries_summarized;
                let entry_id = self.journal.apply_compaction(outcome.summary_text, outcome.first_summarized_id, outcome.last_summarized_id, ts);
                tracing::debug!(entry_id = %entry_id, entries_summarized, "appended compaction summary entry");
            }
            Err(CoreError::CannotCompact) => {
                tracing::warn!("compaction required but no valid cut point; proceeding without compaction");
            }
            Err(err) => {
                tracing::warn!(error = %err, "compaction attempt failed; proceeding without compaction");
            }
        }
    }

    async fn start_turn(&mut self) {
        self.fan_out.publish(SessionEvent::TurnStart);
        self.maybe_compact().await;

        let branch = self.journal.current_branch();
        let effective = build_effective_context(&branch);
        drop(branch);

        let system_prompt = self.build_system_prompt(effective.summary_preamble.as_deref());
        let tool_defs: Vec<ToolDefinition> = self
            .tools
            .schemas()
            .into_iter()
            .map(|(name, description, parameters)| ToolDefinition { name, description, parameters })
            .collect();

        let mut context = RequestContext::new(effective.messages).with_tools(tool_defs);
        if let Some(prompt) = system_prompt {
            context = context.with_system_prompt(prompt);
        }

        self.fan_out.publish(SessionEvent::MessageStart { message: Message::assistant(Vec::new(), None, None, now_ts()) });

        self.state = LoopState::Streaming;
        self.dispatch_llm_call(context).await;
    }

    async fn dispatch_llm_call(&mut self, context: RequestContext) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.current_request_id = Some(request_id);

        let abort = AbortSignal::new();
        self.abort_signal = Some(abort.clone());

        let stream_fn = self.stream_fn.clone();
        let model = self.model.clone();
        let thinking_level = self.thinking_level;
        let retry_policy = RetryPolicy::from_settings(&self.settings.retry);
        let fan_out = self.fan_out.clone();
        let internal_tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let outcome = run_llm_turn(stream_fn.as_ref(), &model, &context, thinking_level, &retry_policy, &abort, &fan_out).await;
            let _ = internal_tx.send(TurnInternalEvent::StreamDone { request_id, outcome }).await;
        });
    }

    async fn handle_stream_done(&mut self, request_id: u64, outcome: StreamOutcome) {
        if self.current_request_id != Some(request_id) {
            tracing::debug!(request_id, "ignoring stale stream outcome");
            return;
        }
        self.current_request_id = None;
        self.abort_signal = None;

        match outcome {
            StreamOutcome::Completed { message } => {
                let ts = now_ts();
                let entry_message = match &message {
                    Message::Assistant { stop_reason: None, .. } => force_stop_reason(message, StopReason::Stop, ts),
                    _ => message,
                };
                self.journal.append(EntryKind::Message { message: entry_message.clone() }, ts);
                self.fan_out.publish(SessionEvent::MessageEnd { message: entry_message.clone() });

                if entry_message.is_tool_use() {
                    let calls: Vec<(String, String, Value)> = entry_message
                        .tool_calls()
                        .into_iter()
                        .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                        .collect();
                    self.dispatch_tool_calls(calls, request_id).await;
                } else {
                    self.finish_turn_and_maybe_continue().await;
                }
            }
            StreamOutcome::Aborted { partial_message } => {
                let ts = now_ts();
                let aborted = force_stop_reason(partial_message, StopReason::Aborted, ts);
                self.journal.append(EntryKind::Message { message: aborted.clone() }, ts);
                self.fan_out.publish(SessionEvent::MessageEnd { message: aborted });
                self.fan_out.publish(SessionEvent::Canceled { reason: "aborted".to_string() });
                self.state = LoopState::Idle;
            }
            StreamOutcome::Failed { kind, message, partial_message } => {
                let ts = now_ts();
                let failed = force_stop_reason(partial_message, StopReason::Error, ts);
                self.journal.append(EntryKind::Message { message: failed.clone() }, ts);
                tracing::error!(wire_kind = kind.as_str(), error = %message, "stream failed");
                self.fan_out.publish(SessionEvent::Error { kind: ErrorKind::StreamFailed, partial_message: Some(failed) });
                self.steer_queue.clear();
                self.follow_up_queue.clear();
                self.state = LoopState::Idle;
            }
        }
    }

    async fn dispatch_tool_calls(&mut self, calls: Vec<(String, String, Value)>, request_id: u64) {
        self.current_request_id = Some(request_id);
        let abort = self.abort_signal.clone().unwrap_or_else(AbortSignal::new);
        self.abort_signal = Some(abort.clone());

        let registry = self.tools.clone();
        let fan_out = self.fan_out.clone();
        let internal_tx = self.internal_tx.clone();
        let observer: Arc<dyn ToolExecutionObserver> = Arc::new(FanOutToolObserver { fan_out });

        tokio::spawn(async move {
            let results = ToolExecutor::execute_calls(&registry, &calls, &abort, observer).await;
            let _ = internal_tx.send(TurnInternalEvent::ToolBatchDone { request_id, results }).await;
        });
    }

    async fn handle_tool_batch_done(&mut self, request_id: u64, results: Vec<(String, ToolOutcome)>) {
        if self.current_request_id != Some(request_id) {
            tracing::debug!(request_id, "ignoring stale tool batch");
            return;
        }
        self.current_request_id = None;
        self.abort_signal = None;

        let aborting = self.state == LoopState::Aborting;

        for (call_id, outcome) in results {
            let ts = now_ts();
            let message = Message::tool_result(call_id, outcome.content_blocks(), outcome.is_error(), ts);
            self.journal.append(EntryKind::Message { message }, ts);
        }

        if aborting {
            self.fan_out.publish(SessionEvent::Canceled { reason: "aborted".to_string() });
            self.state = LoopState::Idle;
            return;
        }

        let messages = self.current_messages();
        self.fan_out.publish(SessionEvent::TurnEnd { message: None, messages });

        if let Some(text) = self.steer_queue.pop_front() {
            let ts = now_ts();
            self.journal.append(EntryKind::Message { message: Message::user(text, ts) }, ts);
        }
        self.start_turn().await;
    }

    async fn finish_turn_and_maybe_continue(&mut self) {
        let messages = self.current_messages();
        self.fan_out.publish(SessionEvent::TurnEnd { message: messages.last().cloned(), messages: messages.clone() });

        if let Some(text) = self.steer_queue.pop_front() {
            let ts = now_ts();
            self.journal.append(EntryKind::Message { message: Message::user(text, ts) }, ts);
            self.start_turn().await;
            return;
        }
        if let Some(text) = self.follow_up_queue.pop_front() {
            let ts = now_ts();
            self.journal.append(EntryKind::Message { message: Message::user(text, ts) }, ts);
            self.start_turn().await;
            return;
        }

        self.fan_out.publish(SessionEvent::AgentEnd { messages });
        self.state = LoopState::Idle;
    }
}

/// Spawns a session actor on the current tokio runtime and returns a
/// handle to it. The returned `JoinHandle` completes once every
/// `SessionHandle` clone has been dropped (the command channel closes).
pub fn spawn_session(config: SessionConfig) -> (SessionHandle, JoinHandle<()>) {
    let session_id = config.session_id.unwrap_or_else(|| turnloop_core::SessionKey::new().to_string());
    let (commands_tx, commands_rx) = mpsc::channel(256);
    let (internal_tx, internal_rx) = mpsc::channel(256);

    let fan_out = Arc::new(EventFanOut::new(session_id.clone()));

    let mut actor = SessionActor {
        session_id: session_id.clone(),
        journal: SessionJournal::new(),
        settings: config.settings,
        system_prompt: config.system_prompt,
        model: config.model,
        thinking_level: config.thinking_level,
        context_window: config.context_window,
        message_count_budget: config.message_count_budget,
        stream_fn: config.stream_fn,
        tools: config.tools,
        fan_out,
        state: LoopState::Idle,
        abort_signal: None,
        current_request_id: None,
        next_request_id: 0,
        steer_queue: VecDeque::new(),
        follow_up_queue: VecDeque::new(),
        commands_rx,
        internal_rx,
        internal_tx,
    };

    let span = tracing::info_span!("session", session_id = %session_id);
    let join = tokio::spawn(async move {
        use tracing::Instrument;
        actor.run().instrument(span).await;
    });

    (SessionHandle { tx: commands_tx }, join)
}
