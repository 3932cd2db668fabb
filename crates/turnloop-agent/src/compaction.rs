//! Token estimation, cut-point selection, and summary generation.

use futures::StreamExt;

use turnloop_core::{
    AbortSignal, CompactionSettings, CoreError, CustomContent, EntryKind, Message, Result, SessionEntry, ThinkingLevel,
};
use turnloop_llm::{ModelDescriptor, RequestContext, StreamEvent, StreamFn, StreamOptions, ToolDefinition};

/// Provider-specific budget that can force compaction by live message count
/// regardless of token estimates. Kept separate from `CompactionSettings`
/// since it isn't one of the recognized settings keys — a caller that wants
/// it constructs one explicitly.
#[derive(Debug, Clone, Default)]
pub struct MessageCountBudget {
    pub request_limit: Option<u64>,
    pub trigger_count: Option<u64>,
    pub keep_recent_messages: Option<u64>,
}

/// `floor(codepoint_count / 4)`, the deterministic, no-external-call token
/// estimator used throughout compaction.
pub fn estimate_text_tokens(s: &str) -> u64 {
    (s.chars().count() as u64) / 4
}

pub fn estimate_entry_tokens(entry: &SessionEntry) -> u64 {
    estimate_text_tokens(&entry.estimable_text())
}

pub fn estimate_branch_tokens(branch: &[&SessionEntry]) -> u64 {
    branch.iter().map(|e| estimate_entry_tokens(e)).sum()
}

/// Sum of per-message text tokens, the system prompt, and every tool
/// schema's serialized size. Additive over message-list concatenation.
pub fn estimate_request_context_tokens(messages: &[Message], system_prompt: Option<&str>, tools: &[ToolDefinition]) -> u64 {
    let messages_sum: u64 = messages.iter().map(|m| estimate_text_tokens(&m.estimable_text())).sum();
    let system_sum = system_prompt.map(estimate_text_tokens).unwrap_or(0);
    let tools_sum: u64 = tools
        .iter()
        .map(|t| estimate_text_tokens(&serde_json::to_string(&t.parameters).unwrap_or_default()))
        .sum();
    messages_sum + system_sum + tools_sum
}

/// `enabled ∧ ctx_tokens > context_window − reserve_tokens`. Strict `>`;
/// equality does not trigger.
pub fn should_compact(ctx_tokens: u64, context_window: u64, settings: &CompactionSettings) -> bool {
    settings.enabled() && ctx_tokens > context_window.saturating_sub(settings.reserve_tokens())
}

/// Whether a message-count budget forces compaction independent of tokens.
pub fn should_force_compact_by_message_count(live_message_count: u64, compaction_enabled: bool, budget: Option<&MessageCountBudget>) -> bool {
    if !compaction_enabled {
        return false;
    }
    budget
        .and_then(|b| b.trigger_count)
        .is_some_and(|trigger| live_message_count >= trigger)
}

#[derive(Debug, Clone, Default)]
pub struct CutPointOptions {
    pub keep_recent_messages: Option<u64>,
    pub force: bool,
}

fn is_valid_cut_point(branch: &[&SessionEntry], i: usize) -> bool {
    let entry = branch[i];
    if !entry.is_cut_point_candidate() {
        return false;
    }
    let calls = entry.tool_calls();
    if calls.is_empty() {
        return true;
    }
    !calls.into_iter().any(|(call_id, _, _)| {
        branch[i + 1..].iter().any(|later| later.tool_result_id() == Some(call_id))
    })
}

/// Finds the last entry (inclusive) that should be summarized: everything
/// at or before the returned id becomes the summarized prefix; everything
/// strictly after it is kept verbatim.
pub fn find_cut_point(branch: &[&SessionEntry], keep_recent_tokens: u64, opts: &CutPointOptions) -> Result<String> {
    if branch.len() <= 1 {
        return Err(CoreError::CannotCompact);
    }

    let mut accumulated = 0u64;
    let mut kept_count = 0u64;
    let mut target_idx: Option<usize> = None;

    for i in (0..branch.len()).rev() {
        let recent_messages_satisfied = opts
            .keep_recent_messages
            .map(|required| kept_count >= required)
            .unwrap_or(true);
        if accumulated >= keep_recent_tokens && recent_messages_satisfied {
            target_idx = Some(i);
            break;
        }
        accumulated += estimate_entry_tokens(branch[i]);
        kept_count += 1;
    }

    let target_idx = match target_idx {
        Some(idx) => idx,
        None if opts.force => {
            let keep_recent = opts.keep_recent_messages.unwrap_or(1).max(1) as usize;
            branch.len().saturating_sub(keep_recent + 1)
        }
        None => return Err(CoreError::CannotCompact),
    };

    for i in (0..=target_idx).rev() {
        if is_valid_cut_point(branch, i) {
            return Ok(branch[i].id.clone());
        }
    }
    Err(CoreError::CannotCompact)
}

/// The result of `build_effective_context`: the preamble text from the
/// most recent summary (if any) and the messages that follow it, ready to
/// hand to `RequestContext`.
pub struct EffectiveContext {
    pub summary_preamble: Option<String>,
    pub messages: Vec<Message>,
}

fn custom_message_as_model_message(custom_type: &str, content: &CustomContent, timestamp: i64) -> Message {
    Message::user(format!("[{custom_type}] {}", content.estimable_text()), timestamp)
}

/// Replaces the summarized prefix with its preamble at context-build time,
/// without mutating the journal: entries remain in storage for inspection
/// and replay, they're just excluded from what gets sent to the model.
/// `custom_message` entries with no content are hidden markers and are
/// never forwarded; ones with content are rendered as a tagged user
/// message so the model still sees them.
pub fn build_effective_context(branch: &[&SessionEntry]) -> EffectiveContext {
    let summary_pos = branch.iter().rposition(|e| matches!(e.kind, EntryKind::Summary { .. }));

    let (summary_preamble, cut_id) = match summary_pos {
        Some(i) => match &branch[i].kind {
            EntryKind::Summary { summary_text, replaced_range } => (Some(summary_text.clone()), Some(replaced_range.1.clone())),
            _ => unreachable!(),
        },
        None => (None, None),
    };

    let start_idx = match &cut_id {
        Some(id) => branch.iter().position(|e| e.id == *id).map(|i| i + 1).unwrap_or(0),
        None => 0,
    };

    let mut messages = Vec::new();
    for entry in &branch[start_idx..] {
        match &entry.kind {
            EntryKind::Message { message } => messages.push(message.clone()),
            EntryKind::CustomMessage { custom_type, content: Some(content), .. } => {
                messages.push(custom_message_as_model_message(custom_type, content, entry.timestamp));
            }
            EntryKind::CustomMessage { content: None, .. } | EntryKind::ModelChange { .. } | EntryKind::Summary { .. } => {}
        }
    }

    EffectiveContext { summary_preamble, messages }
}

const TOOL_RESULT_TRUNCATE_CHARS: usize = 500;
const RAW_MESSAGE_TRUNCATE_CHARS: usize = 200;

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}

fn format_entries_for_summary_prompt(entries: &[&SessionEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        match &entry.kind {
            EntryKind::Message { message: Message::ToolResult { content, .. } } => {
                let text: String = content.iter().filter_map(|b| b.estimable_text()).collect();
                out.push_str(&format!("[tool_result] {}\n", truncate_chars(&text, TOOL_RESULT_TRUNCATE_CHARS)));
            }
            EntryKind::Message { message } => {
                out.push_str(&format!(
                    "[{}] {}\n",
                    message.role_name(),
                    truncate_chars(&message.estimable_text(), RAW_MESSAGE_TRUNCATE_CHARS)
                ));
            }
            EntryKind::CustomMessage { custom_type, content, .. } => {
                let text = content.as_ref().map(CustomContent::estimable_text).unwrap_or_default();
                out.push_str(&format!("[{custom_type}] {}\n", truncate_chars(&text, RAW_MESSAGE_TRUNCATE_CHARS)));
            }
            EntryKind::ModelChange { provider, model_id } => {
                out.push_str(&format!("[model_change] {provider}:{model_id}\n"));
            }
            EntryKind::Summary { summary_text, .. } => {
                out.push_str(&format!("[prior_summary] {}\n", truncate_chars(summary_text, RAW_MESSAGE_TRUNCATE_CHARS)));
            }
        }
    }
    out
}

fn build_summary_prompt(entries: &[&SessionEntry]) -> String {
    format!(
        "Summarize the following conversation prefix concisely, preserving decisions, facts, and open threads a continuing assistant would need:\n\n{}",
        format_entries_for_summary_prompt(entries)
    )
}

async fn generate_summary_via_stream(
    stream_fn: &dyn StreamFn,
    model: &ModelDescriptor,
    prompt: String,
    thinking_level: ThinkingLevel,
    abort: &AbortSignal,
) -> Result<String> {
    let context = RequestContext::new(vec![Message::user(prompt, 0)]);
    let opts = StreamOptions::new(abort.child(), thinking_level);
    let mut stream = stream_fn
        .stream(model, &context, opts)
        .await
        .map_err(|e| CoreError::stream_failed(e.wire_kind().as_str()))?;

    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event.map_err(|e| CoreError::stream_failed(e.wire_kind().as_str()))? {
            StreamEvent::TextDelta { chunk, .. } => text.push_str(&chunk),
            StreamEvent::Done { final_message, .. } => {
                if text.is_empty() {
                    text = final_message.estimable_text();
                }
            }
            StreamEvent::Error { message, .. } => return Err(CoreError::stream_failed(message)),
            _ => {}
        }
    }
    Ok(text)
}

/// The data a caller needs to append a `summary` entry. Compaction itself
/// never touches the journal — the session actor is the sole journal
/// writer, so this just computes what that write should contain.
pub struct CompactionResult {
    pub first_summarized_id: String,
    pub last_summarized_id: String,
    pub summary_text: String,
    pub entries_summarized: usize,
    pub from_llm: bool,
}

/// Runs one compaction pass: picks a cut point, then either uses a
/// caller-supplied summary verbatim or calls the model through `stream_fn`.
#[allow(clippy::too_many_arguments)]
pub async fn run_compaction(
    branch: &[&SessionEntry],
    keep_recent_tokens: u64,
    cut_opts: &CutPointOptions,
    verbatim_summary: Option<String>,
    stream_fn: &dyn StreamFn,
    model: &ModelDescriptor,
    thinking_level: ThinkingLevel,
    abort: &AbortSignal,
) -> Result<CompactionResult> {
    if abort.is_aborted() {
        return Err(CoreError::Aborted);
    }

    let cut_id = find_cut_point(branch, keep_recent_tokens, cut_opts)?;
    let cut_idx = branch
        .iter()
        .position(|e| e.id == cut_id)
        .expect("find_cut_point only returns ids present in branch");
    let summarized = &branch[..=cut_idx];
    let entries_summarized = summarized.len();
    let first_summarized_id = summarized
        .first()
        .map(|e| e.id.clone())
        .unwrap_or_else(|| cut_id.clone());

    let (summary_text, from_llm) = match verbatim_summary {
        Some(text) => (text, false),
        None => {
            let prompt = build_summary_prompt(summarized);
            let text = generate_summary_via_stream(stream_fn, model, prompt, thinking_level, abort).await?;
            (text, true)
        }
    };

    tracing::info!(
        entries_summarized,
        estimated_tokens_reclaimed = estimate_branch_tokens(summarized),
        from_llm,
        "compaction run complete"
    );

    Ok(CompactionResult {
        first_summarized_id,
        last_summarized_id: cut_id,
        summary_text,
        entries_summarized,
        from_llm,
    })
}
