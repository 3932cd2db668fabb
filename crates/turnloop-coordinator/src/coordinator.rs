//! Spawns bounded, independent sub-sessions and aggregates their typed
//! results (§4.6). Each sub-session is a full `turnloop_agent::Session`
//! with its own journal; the coordinator never shares state between them
//! beyond the model/tool catalog and a common cancellation root.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use turnloop_agent::{spawn_session, SessionConfig, SessionEvent, SessionHandle};
use turnloop_core::Message;

use crate::catalog::SubagentCatalog;
use crate::lanes::LaneQueue;
use crate::naming::spec_id;

/// One requested sub-agent run.
#[derive(Debug, Clone)]
pub struct SubagentSpec {
    pub prompt: String,
    pub subagent: Option<String>,
    pub description: Option<String>,
    /// Semantic scheduling lane (§5). Defaults to `"subagent"` when unset;
    /// not part of the distilled spec's literal field list but needed to
    /// realize the lane-cap behavior it names.
    pub lane: Option<String>,
}

impl SubagentSpec {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            subagent: None,
            description: None,
            lane: None,
        }
    }

    pub fn with_subagent(mut self, name: impl Into<String>) -> Self {
        self.subagent = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentRunStatus {
    Completed,
    Error,
    Timeout,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub id: String,
    pub status: SubagentRunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { timeout: None }
    }
}

pub struct CoordinatorConfig {
    pub default_timeout: Duration,
    pub lane_caps: HashMap<String, usize>,
    pub default_lane_cap: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            lane_caps: HashMap::new(),
            default_lane_cap: 1,
        }
    }
}

struct ActiveEntry {
    handle: SessionHandle,
}

/// Owns the map of currently-running sub-sessions. Cheaply cloneable —
/// every clone shares the same catalog, lane queue and active-run table.
#[derive(Clone)]
pub struct Coordinator {
    catalog: Arc<SubagentCatalog>,
    default_timeout: Duration,
    lanes: Arc<LaneQueue>,
    active: Arc<DashMap<String, ActiveEntry>>,
    next_salt: Arc<AtomicU64>,
}

impl Coordinator {
    pub fn new(catalog: SubagentCatalog, config: CoordinatorConfig) -> Self {
        Self {
            catalog: Arc::new(catalog),
            default_timeout: config.default_timeout,
            lanes: Arc::new(LaneQueue::new(config.lane_caps, config.default_lane_cap)),
            active: Arc::new(DashMap::new()),
            next_salt: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Runs every spec as an independent sub-session and returns results in
    /// the same order as `specs`. A spec naming an unregistered subagent
    /// never spawns anything and resolves immediately.
    pub async fn run_subagents(&self, specs: Vec<SubagentSpec>, opts: RunOptions) -> Vec<SubagentResult> {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let mut tasks = Vec::with_capacity(specs.len());

        for spec in specs {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run_one(spec, timeout).await }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    warn!(error = %join_err, "sub-session task panicked");
                    results.push(SubagentResult {
                        id: "unknown".to_string(),
                        status: SubagentRunStatus::Error,
                        result: None,
                        error: Some(format!("sub-session crashed: {join_err}")),
                        session_id: None,
                    });
                }
            }
        }
        results
    }

    async fn run_one(&self, spec: SubagentSpec, timeout: Duration) -> SubagentResult {
        let salt = self.next_salt.fetch_add(1, Ordering::SeqCst);
        let seed = spec.description.as_deref().unwrap_or(&spec.prompt);
        let id = spec_id(seed, salt);

        let Some(type_config) = self.catalog.resolve(spec.subagent.as_deref()) else {
            let name = spec.subagent.clone().unwrap_or_default();
            debug!(id = %id, subagent = %name, "unknown subagent requested");
            return SubagentResult {
                id,
                status: SubagentRunStatus::Error,
                result: None,
                error: Some(format!("Unknown subagent: {name}")),
                session_id: None,
            };
        };

        let lane = spec.lane.clone().unwrap_or_else(|| "subagent".to_string());
        let _permit = self.lanes.acquire(&lane).await;

        let session_id = turnloop_core::SessionKey::new().to_string();
        let (handle, join) = spawn_session(SessionConfig {
            session_id: Some(session_id.clone()),
            settings: type_config.settings.clone(),
            model: type_config.model.clone(),
            thinking_level: type_config.thinking_level,
            system_prompt: type_config.system_prompt.clone(),
            context_window: type_config.context_window,
            message_count_budget: type_config.message_count_budget.clone(),
            stream_fn: type_config.stream_fn.clone(),
            tools: type_config.tools.clone(),
        });

        self.active.insert(id.clone(), ActiveEntry { handle: handle.clone() });
        info!(id = %id, session_id = %session_id, lane = %lane, "sub-session started");

        let outcome = self.drive(&handle, &spec.prompt, timeout).await;

        self.active.remove(&id);
        drop(handle);
        drop(join); // the actor exits once every handle clone has dropped

        match outcome {
            Ok((status, text)) => SubagentResult {
                id,
                status,
                result: text,
                error: None,
                session_id: Some(session_id),
            },
            Err(message) => SubagentResult {
                id,
                status: SubagentRunStatus::Error,
                result: None,
                error: Some(message),
                session_id: Some(session_id),
            },
        }
    }

    async fn drive(&self, handle: &SessionHandle, prompt: &str, timeout: Duration) -> Result<(SubagentRunStatus, Option<String>), String> {
        let Some(mut mailbox) = handle.subscribe_mailbox(256).await else {
            return Err("sub-session actor unavailable".to_string());
        };

        if let Err(err) = handle.prompt(prompt.to_string()).await {
            return Err(format!("{err}"));
        }

        let wait = async {
            loop {
                match mailbox.recv().await {
                    Some(envelope) => match envelope.event {
                        SessionEvent::AgentEnd { messages } => return Ok(final_text(&messages)),
                        SessionEvent::Error { kind, .. } => return Err(format!("{kind:?}")),
                        SessionEvent::Canceled { reason } => return Ok((SubagentRunStatus::Aborted, None, reason)),
                        _ => continue,
                    },
                    None => return Err("sub-session event stream closed".to_string()),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok((status, text, _reason))) => Ok((status, text)),
            Ok(Err(message)) => Err(message),
            Err(_elapsed) => {
                handle.abort().await;
                Ok((SubagentRunStatus::Timeout, None))
            }
        }
    }

    /// Signals every currently-active sub-session to abort. Does not wait
    /// for them to drain; callers observe the resulting `Aborted` status in
    /// `run_subagents`'s return value.
    pub async fn abort_all(&self) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some(entry) = self.active.get(&id) {
                entry.handle.abort().await;
            }
        }
    }

    pub fn list_active(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }
}

fn final_text(messages: &[Message]) -> (SubagentRunStatus, Option<String>, String) {
    let text = messages.iter().rev().find_map(|m| match m {
        Message::Assistant { content, .. } => {
            let joined: String = content.iter().filter_map(|b| b.estimable_text()).collect();
            if joined.is_empty() { None } else { Some(joined) }
        }
        _ => None,
    });
    (SubagentRunStatus::Completed, text, "completed".to_string())
}
