//! A single agent session: one subprocess, two cooperating tokio tasks.
//!
//! Grounded in `sdk_session.py`'s `SDKSession`: a sender task drains an
//! injection queue and calls `query()` immediately (mid-turn steering), a
//! receiver task drains `receive_messages()` continuously and resets
//! `pending_queries_count` to zero on every `ResultToken` — not
//! decremented, since several queries can merge into a single result.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use chrono::{DateTime, Utc};

use sa_domain::chat_id::ChatId;
use sa_domain::error::{Error, Result};
use sa_domain::tier::Tier;
use sa_domain::trace::TraceEvent;

use crate::adapter::{AgentAdapter, AgentMessage, AgentStartOptions, ToolUse};
use crate::registry::SessionType;

const SEND_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const STALE_IDLE_THRESHOLD: Duration = Duration::from_secs(600);
const MAX_CONSECUTIVE_SEND_FAILURES: u32 = 3;
const STALE_PENDING_TOOL_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Shared, lock-free health/activity counters read by both tasks and by
/// the health supervisor without needing the session's subprocess lock.
struct SharedState {
    running: AtomicBool,
    pending_queries: AtomicU32,
    error_count: AtomicU32,
    /// Consecutive `ResultToken`s reporting `is_error=true`, independent of
    /// `error_count` (which tracks send-dispatch failures). Cleared on any
    /// non-error ResultToken.
    consecutive_error_turns: AtomicU32,
    queue_len: AtomicU32,
}

/// One agent subprocess and the two tasks driving it. `chat_id`/`tier`/`cwd`
/// are immutable for the session's lifetime; a tier change requires killing
/// and recreating the session (§4.3 "TierMismatchRestart").
pub struct Session {
    pub chat_id: ChatId,
    pub contact_name: String,
    pub tier: Tier,
    pub cwd: PathBuf,
    pub session_name: String,
    pub model: String,
    pub session_type: SessionType,
    pub created_at: DateTime<Utc>,

    state: Arc<SharedState>,
    inject_tx: Option<mpsc::UnboundedSender<String>>,
    sender_task: Option<JoinHandle<()>>,
    receiver_task: Option<JoinHandle<()>>,
    last_activity: Arc<Mutex<Instant>>,
    session_id: Arc<Mutex<Option<String>>>,
    /// Set by the orchestrator before the first `inject`, consumed by the
    /// sender task on its first send — defers composing the (possibly
    /// expensive) system prompt until after the create/restart lock is
    /// released (§4.2 "Deferred system-prompt injection").
    pending_system_prompt: Arc<Mutex<Option<String>>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat_id: ChatId,
        contact_name: String,
        tier: Tier,
        cwd: PathBuf,
        session_name: String,
        model: String,
        session_type: SessionType,
    ) -> Self {
        Self {
            chat_id,
            contact_name,
            tier,
            cwd,
            session_name,
            model,
            session_type,
            created_at: Utc::now(),
            state: Arc::new(SharedState {
                running: AtomicBool::new(false),
                pending_queries: AtomicU32::new(0),
                error_count: AtomicU32::new(0),
                consecutive_error_turns: AtomicU32::new(0),
                queue_len: AtomicU32::new(0),
            }),
            inject_tx: None,
            sender_task: None,
            receiver_task: None,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            session_id: Arc::new(Mutex::new(None)),
            pending_system_prompt: Arc::new(Mutex::new(None)),
        }
    }

    /// Current resumable conversation id, updated from the most recent
    /// `ResultToken`. Used by the restart sequence (§4.5) as `resume_id`.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    /// Queue a system prompt to be injected ahead of the next `inject()`
    /// call, without requiring the caller to hold any session lock while
    /// composing it.
    pub async fn defer_system_prompt(&self, prompt: String) {
        *self.pending_system_prompt.lock().await = Some(prompt);
    }

    /// Start the subprocess and spawn the sender/receiver task pair.
    /// `adapter` must not already be connected.
    pub async fn start(
        &mut self,
        mut adapter: Box<dyn AgentAdapter>,
        start_options: AgentStartOptions,
    ) -> Result<()> {
        adapter.connect(start_options).await?;
        self.state.running.store(true, Ordering::Release);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let adapter = Arc::new(Mutex::new(adapter));

        let receiver_state = self.state.clone();
        let receiver_adapter = adapter.clone();
        let chat_id_for_receiver = self.chat_id.clone();
        let session_id_slot = self.session_id.clone();
        let last_activity_for_receiver = self.last_activity.clone();
        self.receiver_task = Some(tokio::spawn(async move {
            receive_loop(
                receiver_adapter,
                receiver_state,
                chat_id_for_receiver,
                session_id_slot,
                last_activity_for_receiver,
            )
            .await;
        }));

        let sender_state = self.state.clone();
        let sender_adapter = adapter;
        let last_activity = self.last_activity.clone();
        let pending_prompt = self.pending_system_prompt.clone();
        let contact_name = self.contact_name.clone();
        self.sender_task = Some(tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            while sender_state.running.load(Ordering::Acquire) {
                let recv = tokio::time::timeout(SEND_QUEUE_TIMEOUT, rx.recv()).await;
                let msg = match recv {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break, // channel closed: session stopped
                    Err(_) => continue, // 30s timeout: loop to re-check `running`
                };

                *last_activity.lock().await = Instant::now();
                sender_state.queue_len.fetch_sub(1, Ordering::AcqRel);

                let mut text = msg;
                if let Some(prompt) = pending_prompt.lock().await.take() {
                    text = format!("{prompt}\n\n{text}");
                }

                sender_state.pending_queries.fetch_add(1, Ordering::AcqRel);
                let mut guard = sender_adapter.lock().await;
                match guard.query(&text).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                    }
                    Err(e) => {
                        drop(guard);
                        sender_state.pending_queries.fetch_sub(1, Ordering::AcqRel);
                        sender_state.error_count.fetch_add(1, Ordering::AcqRel);
                        consecutive_failures += 1;
                        tracing::warn!(contact = %contact_name, error = %e, "query dispatch failed");
                        if consecutive_failures >= MAX_CONSECUTIVE_SEND_FAILURES {
                            sender_state.running.store(false, Ordering::Release);
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(2 * consecutive_failures as u64)).await;
                    }
                }
            }
        }));

        self.inject_tx = Some(tx);
        Ok(())
    }

    /// Queue a message for delivery; the sender task dispatches it as soon
    /// as it is free, allowing mid-turn steering.
    pub fn inject(&self, text: impl Into<String>) -> Result<()> {
        let tx = self
            .inject_tx
            .as_ref()
            .ok_or_else(|| Error::Session("session not started".into()))?;
        self.state.queue_len.fetch_add(1, Ordering::AcqRel);
        tx.send(text.into())
            .map_err(|_| Error::Session("inject channel closed".into()))
    }

    pub fn is_busy(&self) -> bool {
        self.state.pending_queries.load(Ordering::Acquire) > 0
    }

    pub fn is_alive(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
            && self
                .sender_task
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false)
    }

    /// Mirrors `SDKSession.is_healthy`: alive, fewer than 3 accumulated
    /// errors, fewer than 3 consecutive error-flagged turns, and not
    /// stalled (queue non-empty but idle >10 min).
    pub async fn is_healthy(&self) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.state.error_count.load(Ordering::Acquire) >= 3 {
            return false;
        }
        if self.state.consecutive_error_turns.load(Ordering::Acquire) >= 3 {
            return false;
        }
        if self.state.queue_len.load(Ordering::Acquire) > 0 {
            let idle = self.last_activity.lock().await.elapsed();
            if idle > STALE_IDLE_THRESHOLD {
                return false;
            }
        }
        true
    }

    pub fn pending_queries_count(&self) -> u32 {
        self.state.pending_queries.load(Ordering::Acquire)
    }

    pub fn error_count(&self) -> u32 {
        self.state.error_count.load(Ordering::Acquire)
    }

    pub fn consecutive_error_turns(&self) -> u32 {
        self.state.consecutive_error_turns.load(Ordering::Acquire)
    }

    /// Time since the last enqueue or `ResultToken`, used by the Idle
    /// Reaper (§4.6) and the health supervisor's staleness check.
    pub async fn idle_duration(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    /// Stop the session: cancel both tasks, which causes the adapter to be
    /// dropped (and its subprocess killed) inside `receive_loop`'s cleanup.
    pub async fn stop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        self.inject_tx = None; // closes the channel, unblocking the sender's recv

        if let Some(task) = self.sender_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.receiver_task.take() {
            task.abort();
            let _ = task.await;
        }
        TraceEvent::SessionKilled {
            chat_id: self.chat_id.as_str().to_string(),
        }
        .emit();
    }
}

async fn receive_loop(
    adapter: Arc<Mutex<Box<dyn AgentAdapter>>>,
    state: Arc<SharedState>,
    chat_id: ChatId,
    session_id_slot: Arc<Mutex<Option<String>>>,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut consecutive_errors: u32 = 0;
    // tool_use_id -> (start_time, tool_name, tool_input). Mutated only by
    // this task, so a plain map suffices (mirrors `sdk_session.py`'s
    // `self._pending_tools` dict, owned by the single receive loop).
    let mut pending_tools: HashMap<String, (Instant, String, serde_json::Value)> = HashMap::new();
    loop {
        if !state.running.load(Ordering::Acquire) {
            break;
        }
        let next = {
            let mut guard = adapter.lock().await;
            guard.receive_message().await
        };
        match next {
            Ok(Some(AgentMessage::ResultToken { is_error, session_id })) => {
                *last_activity.lock().await = Instant::now();
                // Reset to exactly zero regardless of how many queries were
                // merged into this turn — never a decrement.
                state.pending_queries.store(0, Ordering::Release);
                if !is_error {
                    state.error_count.store(0, Ordering::Release);
                }
                if is_error {
                    state.consecutive_error_turns.fetch_add(1, Ordering::AcqRel);
                } else {
                    state.consecutive_error_turns.store(0, Ordering::Release);
                }
                if let Some(id) = session_id {
                    *session_id_slot.lock().await = Some(id);
                }
                prune_stale_pending_tools(&mut pending_tools, &chat_id);
                TraceEvent::ResultTokenProcessed {
                    chat_id: chat_id.as_str().to_string(),
                    pending_queries_count: 0,
                    is_error,
                }
                .emit();
            }
            Ok(Some(AgentMessage::AssistantToolUseBlock(ToolUse {
                tool_use_id,
                tool_name,
                tool_input,
            }))) => {
                pending_tools.insert(tool_use_id, (Instant::now(), tool_name, tool_input));
            }
            Ok(Some(AgentMessage::UserToolResultBlock { tool_use_id, is_error })) => {
                if let Some((start, tool_name, tool_input)) = pending_tools.remove(&tool_use_id) {
                    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
                    TraceEvent::ToolExecutionTimed {
                        chat_id: chat_id.as_str().to_string(),
                        tool: tool_name.clone(),
                        duration_ms,
                        is_error,
                        input: parse_tool_input(&tool_name, &tool_input),
                    }
                    .emit();
                } else {
                    tracing::warn!(chat_id = %chat_id, tool_use_id = %tool_use_id, "tool result with no pending tool");
                }
            }
            Ok(Some(_)) => {
                // Assistant text / system messages: no counter change.
            }
            Ok(None) => break, // stream ended: subprocess exited
            Err(e) => {
                consecutive_errors += 1;
                state.error_count.fetch_add(1, Ordering::AcqRel);
                tracing::warn!(chat_id = %chat_id, error = %e, "receive error #{consecutive_errors}");
                if consecutive_errors >= 3 {
                    state.running.store(false, Ordering::Release);
                    break;
                }
            }
        }
    }
    let mut guard = adapter.lock().await;
    guard.disconnect().await;
}

/// Drops pending-tool entries whose `UserToolResultBlock` never arrived
/// within 30 min (dead edge case: a subprocess that dies mid-tool-call).
fn prune_stale_pending_tools(
    pending_tools: &mut HashMap<String, (Instant, String, serde_json::Value)>,
    chat_id: &ChatId,
) {
    let stale: Vec<String> = pending_tools
        .iter()
        .filter(|(_, (start, _, _))| start.elapsed() > STALE_PENDING_TOOL_THRESHOLD)
        .map(|(id, _)| id.clone())
        .collect();
    for tool_use_id in stale {
        pending_tools.remove(&tool_use_id);
        TraceEvent::PendingToolStale {
            chat_id: chat_id.as_str().to_string(),
            tool_use_id,
        }
        .emit();
    }
}

/// Structured input parse for the tool-timing metric: a bash command name
/// (and skill, if the command lives under a `skills/<name>/` path), a file
/// tool's directory+extension, or a fetch tool's URL domain. Unknown tools
/// pass through with their raw input, matching `perf.log_tool_execution`'s
/// fallback.
fn parse_tool_input(tool_name: &str, input: &serde_json::Value) -> serde_json::Value {
    match tool_name {
        "Bash" => {
            let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
            let mut out = serde_json::Map::new();
            if let Some(first_word) = command.split_whitespace().next() {
                let cmd_name = first_word.rsplit('/').next().unwrap_or(first_word);
                out.insert("cmd_name".into(), serde_json::Value::String(cmd_name.into()));
                if let Some(idx) = first_word.find("skills/") {
                    let rest = &first_word[idx + "skills/".len()..];
                    if let Some(skill) = rest.split('/').next() {
                        if !skill.is_empty() {
                            out.insert("skill".into(), serde_json::Value::String(skill.into()));
                        }
                    }
                }
            }
            serde_json::Value::Object(out)
        }
        "Read" | "Write" | "Edit" => {
            let file_path = input.get("file_path").and_then(|v| v.as_str()).unwrap_or("");
            let path = std::path::Path::new(file_path);
            let mut out = serde_json::Map::new();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{e}"));
            out.insert(
                "extension".into(),
                extension.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
            );
            if let Some(dir) = path.parent().and_then(|p| p.to_str()) {
                out.insert("directory".into(), serde_json::Value::String(dir.into()));
            }
            serde_json::Value::Object(out)
        }
        "WebFetch" => {
            let mut out = serde_json::Map::new();
            if let Some(url) = input.get("url").and_then(|v| v.as_str()) {
                let domain = url
                    .split("://")
                    .nth(1)
                    .unwrap_or(url)
                    .split('/')
                    .next()
                    .map(|d| d.to_string());
                out.insert(
                    "domain".into(),
                    domain.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
                );
            }
            serde_json::Value::Object(out)
        }
        _ => input.clone(),
    }
}
