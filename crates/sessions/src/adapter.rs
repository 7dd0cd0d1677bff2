//! Abstraction over the agent subprocess a [`crate::session::Session`] drives.
//!
//! The real implementation shells out to an external agent CLI per turn and
//! streams its JSON-lines output (grounded in `original_source/assistant
//! /sdk_session.py`'s `ClaudeSDKClient` usage: `connect`/`query`/
//! `receive_messages`/`interrupt`/`disconnect`). That SDK is Python-only, so
//! here it is an injected trait object — the orchestrator and Session never
//! depend on the concrete transport, only on this interface, which also lets
//! tests drive a scripted fake instead of a real subprocess.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sa_domain::error::Result;

/// One tool invocation the agent made mid-turn, surfaced for per-session
/// logging and the `_pending_tools` staleness check (`sdk_session.py`'s
/// `_cleanup_stale_pending_tools`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
}

/// A single message surfaced by [`AgentAdapter::receive_messages`].
///
/// `ResultToken` is the turn boundary: the session's `pending_queries_count`
/// must be forced to exactly zero whenever one arrives, regardless of how
/// many queries were merged into the turn that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AgentMessage {
    AssistantTextBlock { text: String },
    AssistantToolUseBlock(ToolUse),
    UserToolResultBlock { tool_use_id: String, is_error: bool },
    SystemMessage { subtype: String },
    ResultToken { is_error: bool, session_id: Option<String> },
}

/// Options needed to start or resume an agent subprocess for one session.
/// Built by [`crate::policy`] from the contact's [`sa_domain::tier::Tier`].
#[derive(Debug, Clone)]
pub struct AgentStartOptions {
    pub cwd: std::path::PathBuf,
    pub allowed_tools: Vec<&'static str>,
    pub bypass_permissions: bool,
    pub model: String,
    pub fallback_model: Option<String>,
    pub max_turns: u32,
    pub max_buffer_bytes: usize,
    pub resume_session_id: Option<String>,
    pub fresh_session_id: Option<String>,
    pub system_prompt: Option<String>,
}

/// Injected boundary between a [`crate::session::Session`] and the agent
/// subprocess it drives. One adapter instance is owned per session; it is
/// not `Clone` because it wraps live subprocess state.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    /// Launch (or resume) the agent subprocess. Must be called exactly once
    /// before any other method.
    async fn connect(&mut self, options: AgentStartOptions) -> Result<()>;

    /// Dispatch one user turn. Returns once the agent has accepted the
    /// query; the resulting messages arrive asynchronously through
    /// `receive_messages`, not as this call's return value — this mirrors
    /// the concurrent sender/receiver split that enables mid-turn steering.
    async fn query(&mut self, text: &str) -> Result<()>;

    /// Pull the next message from the agent's output stream. Returns `Ok(None)`
    /// when the stream has ended (subprocess exited or disconnected).
    async fn receive_message(&mut self) -> Result<Option<AgentMessage>>;

    /// Interrupt the current turn (used for the admin-only `RESTART`
    /// intercept and for an unhealthy-session auto-restart).
    async fn interrupt(&mut self) -> Result<()>;

    /// True while the underlying subprocess is alive.
    fn is_alive(&self) -> bool;

    /// Tear down the subprocess, killing it if it has not exited on its own
    /// (prevents zombie processes surviving a session restart).
    async fn disconnect(&mut self);
}

/// `[Open Question, §9 #1]`: no real agent CLI wire protocol is available in
/// this environment to ground a subprocess-backed `AgentAdapter` against —
/// the original system drives it through a Python SDK that owns the
/// subprocess internally. `FakeAgentAdapter` is therefore both the test
/// double and the crate's only bundled adapter; a production deployment
/// supplies its own `AgentAdapterFactory` wrapping whatever CLI it targets.
pub mod fake {
    //! Scripted [`AgentAdapter`] double. A caller pre-loads a script of
    //! [`AgentMessage`]s to emit per `query()` call; `receive_message` drains
    //! them in order, yielding `ResultToken` exactly once per scripted turn
    //! unless the script omits one (to exercise the merged-turn case where
    //! several `query()` calls precede a single `ResultToken`).

    use super::*;
    use std::collections::VecDeque;

    pub struct FakeAgentAdapter {
        pub queue: VecDeque<AgentMessage>,
        pub queries_seen: Vec<String>,
        pub alive: bool,
        pub fail_next_query: bool,
        pub interrupts: u32,
    }

    impl FakeAgentAdapter {
        pub fn new() -> Self {
            Self {
                queue: VecDeque::new(),
                queries_seen: Vec::new(),
                alive: true,
                fail_next_query: false,
                interrupts: 0,
            }
        }

        pub fn push(&mut self, msg: AgentMessage) {
            self.queue.push_back(msg);
        }
    }

    impl Default for FakeAgentAdapter {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl AgentAdapter for FakeAgentAdapter {
        async fn connect(&mut self, _options: AgentStartOptions) -> Result<()> {
            self.alive = true;
            Ok(())
        }

        async fn query(&mut self, text: &str) -> Result<()> {
            self.queries_seen.push(text.to_string());
            if self.fail_next_query {
                self.fail_next_query = false;
                return Err(sa_domain::error::Error::Agent("scripted failure".into()));
            }
            Ok(())
        }

        async fn receive_message(&mut self) -> Result<Option<AgentMessage>> {
            Ok(self.queue.pop_front())
        }

        async fn interrupt(&mut self) -> Result<()> {
            self.interrupts += 1;
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive
        }

        async fn disconnect(&mut self) {
            self.alive = false;
        }
    }
}
