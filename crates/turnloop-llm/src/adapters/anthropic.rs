//! A reference `StreamFn` implementation against the Anthropic Messages API.
//!
//! Unlike an earlier adapter this one is grounded on, `stop_reason` is
//! threaded through from `message_delta`/`message_stop` instead of being
//! logged and discarded — the contract requires an accurate stop reason on
//! every Assistant entry, not just "did the stream end".

use async_stream::stream;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use turnloop_core::{ContentBlock, Message, StopReason, Usage};

use crate::error::{LlmError, LlmResult, WireErrorKind};
use crate::request::{ModelDescriptor, RequestContext};
use crate::stream::{PartialToolCall, StreamEvent, ToolCall};
use crate::provider::{LlmStream, StreamFn, StreamOptions};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicStreamFn {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicStreamFn {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: ContentBlockStartPayload,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStartPayload {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String },
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: ContentBlockDeltaPayload,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockDeltaPayload {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDeltaPayload,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize, Clone, Copy, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<AnthropicUsage> for Usage {
    fn from(u: AnthropicUsage) -> Self {
        Usage {
            input: u.input_tokens,
            output: u.output_tokens,
            cache_read: u.cache_read_input_tokens,
            cache_write: u.cache_creation_input_tokens,
            total_tokens: None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

fn map_stop_reason(s: &str) -> StopReason {
    match s {
        "end_turn" => StopReason::Stop,
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::Stop,
        _ => StopReason::Error,
    }
}

fn build_request_body(model: &ModelDescriptor, ctx: &RequestContext) -> Value {
    let messages: Vec<Value> = ctx
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::User { content, .. } => Some(serde_json::json!({
                "role": "user",
                "content": content.text(),
            })),
            Message::Assistant { content, .. } => Some(serde_json::json!({
                "role": "assistant",
                "content": content,
            })),
            Message::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some(serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                    "is_error": is_error,
                }]
            })),
        })
        .collect();

    serde_json::json!({
        "model": model.model_id,
        "max_tokens": 8192,
        "system": ctx.system_prompt,
        "messages": messages,
        "tools": ctx.tools,
        "stream": true,
    })
}

#[async_trait]
impl StreamFn for AnthropicStreamFn {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports_model(&self, model_id: &str) -> bool {
        model_id.starts_with("claude-")
    }

    async fn stream(
        &self,
        model: &ModelDescriptor,
        context: &RequestContext,
        opts: StreamOptions,
    ) -> LlmResult<LlmStream> {
        let url = model.base_url.clone().unwrap_or_else(|| ANTHROPIC_API_URL.to_string());
        let body = build_request_body(model, context);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(LlmError::AuthFailed("invalid api key".into()));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited { retry_after_ms: 60_000 });
        }
        if !status.is_success() {
            return Err(LlmError::RequestFailed(format!("http {status}")));
        }

        Ok(Box::pin(parse_sse_stream(response, opts)))
    }
}

fn parse_sse_stream(
    response: reqwest::Response,
    opts: StreamOptions,
) -> impl futures::Stream<Item = LlmResult<StreamEvent>> {
    stream! {
        use futures::StreamExt;

        let mut byte_stream = response.bytes_stream();
        let mut buf = String::new();
        let mut partial_calls: std::collections::HashMap<usize, PartialToolCall> = std::collections::HashMap::new();
        let mut blocks: std::collections::HashMap<usize, ContentBlock> = std::collections::HashMap::new();
        let mut stop_reason: Option<StopReason> = None;
        let mut latest_usage = Usage::default();

        while let Some(chunk) = byte_stream.next().await {
            if opts.abort_signal.is_aborted() {
                yield Ok(StreamEvent::Error { kind: WireErrorKind::Cancelled, message: "aborted".into() });
                return;
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(LlmError::Network(e));
                    return;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find("\n\n") {
                let raw_event: String = buf.drain(..pos + 2).collect();
                let mut event_name = String::new();
                let mut data = String::new();
                for line in raw_event.lines() {
                    if let Some(rest) = line.strip_prefix("event:") {
                        event_name = rest.trim().to_string();
                    } else if let Some(rest) = line.strip_prefix("data:") {
                        data.push_str(rest.trim());
                    }
                }
                if data.is_empty() {
                    continue;
                }

                match event_name.as_str() {
                    "content_block_start" => {
                        if let Ok(ev) = serde_json::from_str::<ContentBlockStartEvent>(&data) {
                            match ev.content_block {
                                ContentBlockStartPayload::Text { text } => {
                                    blocks.insert(ev.index, ContentBlock::text(text));
                                    yield Ok(StreamEvent::TextStart { idx: ev.index });
                                }
                                ContentBlockStartPayload::Thinking { thinking } => {
                                    blocks.insert(ev.index, ContentBlock::thinking(thinking));
                                    yield Ok(StreamEvent::ThinkingStart { idx: ev.index });
                                }
                                ContentBlockStartPayload::ToolUse { id, name } => {
                                    let partial = PartialToolCall { id, name, arguments_json: String::new() };
                                    partial_calls.insert(ev.index, partial.clone());
                                    yield Ok(StreamEvent::ToolCallStart { idx: ev.index, partial_tool_call: partial });
                                }
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(ev) = serde_json::from_str::<ContentBlockDeltaEvent>(&data) {
                            match ev.delta {
                                ContentBlockDeltaPayload::TextDelta { text } => {
                                    match blocks.entry(ev.index).or_insert_with(|| ContentBlock::text(String::new())) {
                                        ContentBlock::Text { text: t } => t.push_str(&text),
                                        slot => *slot = ContentBlock::text(text.clone()),
                                    }
                                    yield Ok(StreamEvent::TextDelta { idx: ev.index, chunk: text });
                                }
                                ContentBlockDeltaPayload::ThinkingDelta { thinking } => {
                                    match blocks.entry(ev.index).or_insert_with(|| ContentBlock::thinking(String::new())) {
                                        ContentBlock::Thinking { text: t } => t.push_str(&thinking),
                                        slot => *slot = ContentBlock::thinking(thinking.clone()),
                                    }
                                    yield Ok(StreamEvent::ThinkingDelta { idx: ev.index, chunk: thinking });
                                }
                                ContentBlockDeltaPayload::InputJsonDelta { partial_json } => {
                                    if let Some(p) = partial_calls.get_mut(&ev.index) {
                                        p.arguments_json.push_str(&partial_json);
                                    }
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Ok(ev) = serde_json::from_str::<ContentBlockStopEvent>(&data) {
                            if let Some(partial) = partial_calls.remove(&ev.index) {
                                let tool_call = ToolCall {
                                    id: partial.id.clone(),
                                    name: partial.name.clone(),
                                    arguments: partial.parsed_arguments(),
                                };
                                blocks.insert(ev.index, ContentBlock::tool_call(tool_call.id.clone(), tool_call.name.clone(), tool_call.arguments.clone()));
                                yield Ok(StreamEvent::ToolCallEnd { idx: ev.index, tool_call });
                            } else {
                                yield Ok(StreamEvent::TextEnd { idx: ev.index });
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(ev) = serde_json::from_str::<MessageDeltaEvent>(&data) {
                            if let Some(sr) = ev.delta.stop_reason {
                                stop_reason = Some(map_stop_reason(&sr));
                            }
                            if let Some(u) = ev.usage {
                                latest_usage = u.into();
                                yield Ok(StreamEvent::Usage { usage: latest_usage });
                            }
                        }
                    }
                    "message_stop" => {
                        let resolved = stop_reason.unwrap_or(StopReason::Stop);
                        let content: Vec<ContentBlock> = {
                            let mut ordered: Vec<(usize, ContentBlock)> = blocks.drain().collect();
                            ordered.sort_by_key(|(idx, _)| *idx);
                            ordered.into_iter().map(|(_, b)| b).collect()
                        };
                        let final_message = Message::assistant(content, Some(resolved), Some(latest_usage), 0);
                        yield Ok(StreamEvent::Done { stop_reason: resolved, final_message });
                        return;
                    }
                    "error" => {
                        if let Ok(ev) = serde_json::from_str::<ErrorEvent>(&data) {
                            let kind = match ev.error.error_type.as_str() {
                                "overloaded_error" => WireErrorKind::ServerError,
                                "rate_limit_error" => WireErrorKind::RateLimited,
                                "authentication_error" => WireErrorKind::AuthFailed,
                                _ => WireErrorKind::InvalidResponse,
                            };
                            yield Ok(StreamEvent::Error { kind, message: ev.error.message });
                        }
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
