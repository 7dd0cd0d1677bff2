//! The orchestrator: lazy session creation, prompt wrapping, group
//! admission, intercepts, and the vision-enrichment trigger (§4.4).
//!
//! The session map is guarded by a plain `parking_lot::Mutex` held only
//! long enough to look up or insert a per-session handle — never across an
//! `await`. Each handle is itself a `tokio::sync::Mutex<Session>`, so two
//! concurrent messages for the *same* chat serialize on that one session
//! without blocking unrelated sessions from being created or used.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;

use sa_domain::chat_id::ChatId;
use sa_domain::config::Config;
use sa_domain::error::{Error, Result};
use sa_domain::message::{Attachment, Message};
use sa_domain::tier::Tier;
use sa_domain::trace::TraceEvent;

use sa_sessions::adapter::AgentAdapter;
use sa_sessions::policy;
use sa_sessions::registry::{derive_session_name, SessionRegistry, SessionType};
use sa_sessions::Session;

use crate::interfaces::{ContactsDirectory, ReplyChainReader, SummarizeHook, VisionAnalyzer};
use crate::intercepts::{self, Intercept};
use crate::vision;

const REPLY_CHAIN_LIMIT: usize = 10;
const MASTER_CHAT_KEY: &str = "__master__";
/// Marker file a [`SummarizeHook`] writes into a session's `cwd` on
/// shutdown; consumed by [`Orchestrator::resume_pending_summaries`] at
/// startup (§4.7).
pub const PENDING_SUMMARY_FILENAME: &str = ".pending-summary.md";

/// Builds a fresh, unconnected [`AgentAdapter`] for a new session. Kept as
/// a trait (blanket-implemented for closures) rather than a concrete type
/// so tests can hand the orchestrator a factory that returns
/// `FakeAgentAdapter`s.
pub trait AgentAdapterFactory: Send + Sync {
    fn build(&self) -> Box<dyn AgentAdapter>;
}

impl<F> AgentAdapterFactory for F
where
    F: Fn() -> Box<dyn AgentAdapter> + Send + Sync,
{
    fn build(&self) -> Box<dyn AgentAdapter> {
        self()
    }
}

/// Read-only snapshot of a live session, returned by `status`-style queries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub chat_id: String,
    pub session_name: String,
    pub contact_name: String,
    pub tier: Tier,
    pub session_type: SessionType,
    pub is_alive: bool,
    pub pending_queries: u32,
    pub model: String,
    pub idle_secs: i64,
}

pub struct Orchestrator {
    sessions: SyncMutex<HashMap<String, Arc<AsyncMutex<Session>>>>,
    registry: Arc<SessionRegistry>,
    contacts: Arc<dyn ContactsDirectory>,
    reply_chain: Arc<dyn ReplyChainReader>,
    vision_analyzer: Arc<dyn VisionAnalyzer>,
    summarize: Arc<dyn SummarizeHook>,
    adapter_factory: Arc<dyn AgentAdapterFactory>,
    config: Arc<Config>,
    draining: AtomicBool,
    spurious_cancellations: AtomicU32,
    workspace_root: PathBuf,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        contacts: Arc<dyn ContactsDirectory>,
        reply_chain: Arc<dyn ReplyChainReader>,
        vision_analyzer: Arc<dyn VisionAnalyzer>,
        summarize: Arc<dyn SummarizeHook>,
        adapter_factory: Arc<dyn AgentAdapterFactory>,
        config: Arc<Config>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            sessions: SyncMutex::new(HashMap::new()),
            registry,
            contacts,
            reply_chain,
            vision_analyzer,
            summarize,
            adapter_factory,
            config,
            draining: AtomicBool::new(false),
            spurious_cancellations: AtomicU32::new(0),
            workspace_root,
        }
    }

    fn cwd_for(&self, session_name: &str) -> PathBuf {
        self.workspace_root.join(session_name)
    }

    // ───────────────────────────── ingress ─────────────────────────────

    /// Entry point for a direct message. Admin-tier senders are checked for
    /// intercepts before normal routing (§4.4 "Intercepts").
    pub async fn inject_message(&self, message: &Message) -> Result<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(Error::Other("orchestrator is draining".into()));
        }
        if message.is_empty_payload() {
            return Ok(());
        }

        if message.tier.is_admin() {
            if let Some(intercept) = intercepts::parse(&message.text) {
                return self.dispatch_intercept(intercept, message).await;
            }
        }

        let chat_id = message.chat_id.clone();
        let handle = self
            .ensure_session(
                &chat_id,
                message
                    .display_name
                    .clone()
                    .unwrap_or_else(|| message.sender.clone()),
                message.tier,
                SessionType::Individual,
                vec![message.sender.clone()],
                message.source.clone(),
                message.display_name.clone(),
            )
            .await?;

        self.dispatch_vision(&chat_id, message, handle.clone());

        let body = self.wrap_individual(message).await;
        {
            let guard = handle.lock().await;
            guard.inject(body)?;
        }
        self.registry.update_last_message_time(&chat_id);
        Ok(())
    }

    /// Entry point for a group message. A group is only admitted if a
    /// session already exists for it, or at least one participant resolves
    /// to a blessed tier (§4.4 "Group admission").
    pub async fn inject_group_message(&self, message: &Message, participants: &[String]) -> Result<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(Error::Other("orchestrator is draining".into()));
        }
        if message.is_empty_payload() {
            return Ok(());
        }

        let chat_id = message.chat_id.clone();
        let already_has_session = { self.sessions.lock().contains_key(chat_id.as_str()) };
        if !already_has_session {
            let blessed = self.contacts.group_has_blessed_participant(participants).await;
            if !blessed {
                TraceEvent::GroupMessageDropped {
                    chat_id: chat_id.as_str().to_string(),
                    reason: "no blessed participant".into(),
                }
                .emit();
                return Ok(());
            }
        }

        let handle = self
            .ensure_session(
                &chat_id,
                message
                    .group_name
                    .clone()
                    .unwrap_or_else(|| chat_id.as_str().to_string()),
                // Group sessions always run at full capability; the
                // per-message sender's own tier only shapes prompt framing.
                Tier::Admin,
                SessionType::Group,
                participants.to_vec(),
                message.source.clone(),
                message.group_name.clone(),
            )
            .await?;

        self.dispatch_vision(&chat_id, message, handle.clone());

        let body = self.wrap_group(message).await;
        {
            let guard = handle.lock().await;
            guard.inject(body)?;
        }
        self.registry.update_last_message_time(&chat_id);
        Ok(())
    }

    /// Inject a background consolidation prompt — a periodic cross-
    /// conversation summarization job that runs as its own session rather
    /// than inside a contact's live conversation.
    pub async fn inject_consolidation(&self, contact_name: &str, chat_id: &ChatId) -> Result<()> {
        let handle = self
            .ensure_session(
                chat_id,
                contact_name.to_string(),
                Tier::Admin,
                SessionType::Background,
                vec![],
                "background".into(),
                None,
            )
            .await?;
        let guard = handle.lock().await;
        guard.inject(format!("Consolidate recent context for {contact_name}."))
    }

    /// Ensure the persistent admin super-session exists, without injecting
    /// anything into it.
    pub async fn create_master_session(&self) -> Result<()> {
        let chat_id = ChatId::from_canonical(MASTER_CHAT_KEY.to_string());
        self.ensure_session(
            &chat_id,
            "master".into(),
            Tier::Admin,
            SessionType::Master,
            vec![],
            "master".into(),
            None,
        )
        .await?;
        Ok(())
    }

    /// Startup step 2 (§4.7): for every registry entry whose `cwd` holds a
    /// `.pending-summary.md` left by [`SummarizeHook::summarize`] on a prior
    /// shutdown, eagerly recreate that session with the summary prefixed
    /// into its initial system prompt, then consume (unlink) the file.
    /// Entries without one are left alone — they are created lazily on
    /// first message, per the same section's step 3. Returns the number of
    /// sessions resumed this way.
    pub async fn resume_pending_summaries(&self) -> Result<usize> {
        let mut resumed = 0;
        for entry in self.registry.all() {
            let marker = entry.cwd.join(PENDING_SUMMARY_FILENAME);
            let summary = match std::fs::read_to_string(&marker) {
                Ok(s) => s,
                Err(_) => continue,
            };

            self.ensure_session_inner(
                &entry.chat_id,
                entry.contact_name.clone(),
                entry.tier,
                entry.session_type,
                entry.participants.clone(),
                entry.source_backend.clone(),
                entry.display_name.clone(),
                Some(summary),
            )
            .await?;

            if let Err(e) = std::fs::remove_file(&marker) {
                tracing::warn!(path = %marker.display(), error = %e, "failed to unlink consumed pending-summary file");
            }
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Route a `MASTER <prompt>` intercept to the persistent admin session,
    /// creating it first if this is the first use.
    pub async fn inject_master_prompt(&self, admin_id: &str, prompt: &str) -> Result<()> {
        let chat_id = ChatId::from_canonical(MASTER_CHAT_KEY.to_string());
        let handle = self
            .ensure_session(
                &chat_id,
                "master".into(),
                Tier::Admin,
                SessionType::Master,
                vec![admin_id.to_string()],
                "master".into(),
                None,
            )
            .await?;
        let guard = handle.lock().await;
        guard.inject(prompt.to_string())
    }

    async fn dispatch_intercept(&self, intercept: Intercept, message: &Message) -> Result<()> {
        let kind = match &intercept {
            Intercept::HealMe { .. } => "healme",
            Intercept::Master { .. } => "master",
            Intercept::Restart => "restart",
        };
        intercepts::log_triggered(kind, message.chat_id.as_str());

        match intercept {
            Intercept::HealMe { context } => {
                let chat_id = ChatId::from_canonical(format!("healme:{}", uuid::Uuid::new_v4()));
                let handle = self
                    .ensure_session(
                        &chat_id,
                        "healme".into(),
                        Tier::Admin,
                        SessionType::Background,
                        vec![],
                        message.source.clone(),
                        None,
                    )
                    .await?;
                let prompt = match context {
                    Some(c) => format!("Diagnose and heal the following: {c}"),
                    None => "Run a full self-diagnostic and report any issues found.".into(),
                };
                let guard = handle.lock().await;
                guard.inject(prompt)
            }
            Intercept::Master { prompt } => self.inject_master_prompt(&message.sender, &prompt).await,
            Intercept::Restart => {
                self.restart_session(&message.chat_id, None).await?;
                Ok(())
            }
        }
    }

    // ────────────────────────── session lifecycle ──────────────────────

    /// Look up or create the session for `chat_id`. The check-or-insert of
    /// the `Arc<Mutex<Session>>` handle into the session map is one atomic
    /// critical section (never awaits while the sync lock is held) — this
    /// is what makes "at most one Session per ChatId" (§8 invariant 1)
    /// hold even when two messages for a brand-new chat_id race each
    /// other. A caller that loses the race finds the just-inserted handle
    /// and blocks on *its* lock instead of constructing a second Session;
    /// the expensive work (system-prompt composition, subprocess spawn)
    /// runs only once, under that handle's own lock.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_session(
        &self,
        chat_id: &ChatId,
        contact_name: String,
        tier: Tier,
        session_type: SessionType,
        participants: Vec<String>,
        source_backend: String,
        display_name: Option<String>,
    ) -> Result<Arc<AsyncMutex<Session>>> {
        self.ensure_session_inner(
            chat_id,
            contact_name,
            tier,
            session_type,
            participants,
            source_backend,
            display_name,
            None,
        )
        .await
    }

    /// Same as [`Self::ensure_session`], but when it actually creates a new
    /// session (not merely returns an existing one), `extra_system_prompt`
    /// is prefixed ahead of the ordinary composed system prompt. Used by
    /// [`Self::resume_pending_summaries`] (§4.7 "Startup" step 2) to inject
    /// a consumed `.pending-summary.md` into a session eagerly recreated at
    /// startup.
    #[allow(clippy::too_many_arguments)]
    async fn ensure_session_inner(
        &self,
        chat_id: &ChatId,
        contact_name: String,
        tier: Tier,
        session_type: SessionType,
        participants: Vec<String>,
        source_backend: String,
        display_name: Option<String>,
        extra_system_prompt: Option<String>,
    ) -> Result<Arc<AsyncMutex<Session>>> {
        let key = chat_id.as_str().to_string();

        loop {
            let prior = self.registry.get(chat_id);
            let resume_id = prior.as_ref().and_then(|e| e.session_id.clone());
            let resumed = resume_id.is_some();
            let model = prior
                .as_ref()
                .map(|e| e.model.clone())
                .unwrap_or_else(|| self.config.session.default_model.clone());
            let session_name = derive_session_name(&source_backend, chat_id);
            let cwd = prior
                .as_ref()
                .map(|e| e.cwd.clone())
                .unwrap_or_else(|| self.cwd_for(&session_name));

            let (handle, just_created) = {
                let mut map = self.sessions.lock();
                match map.get(&key) {
                    Some(h) => (h.clone(), false),
                    None => {
                        let session = Session::new(
                            chat_id.clone(),
                            contact_name.clone(),
                            tier,
                            cwd.clone(),
                            session_name.clone(),
                            model.clone(),
                            session_type,
                        );
                        let h = Arc::new(AsyncMutex::new(session));
                        map.insert(key.clone(), h.clone());
                        (h, true)
                    }
                }
            };

            if !just_created {
                let needs_recreate = {
                    let guard = handle.lock().await;
                    if !guard.is_alive() {
                        true
                    } else if guard.tier != tier {
                        TraceEvent::TierMismatchRestart {
                            chat_id: key.clone(),
                            old_tier: guard.tier.as_str().to_string(),
                            new_tier: tier.as_str().to_string(),
                        }
                        .emit();
                        true
                    } else {
                        false
                    }
                };

                if !needs_recreate {
                    return Ok(handle);
                }

                {
                    let mut guard = handle.lock().await;
                    guard.stop().await;
                }
                {
                    // Only remove if it's still the handle we just checked —
                    // another caller may have already cleaned it up and
                    // recreated it while we were stopping it.
                    let mut map = self.sessions.lock();
                    if map.get(&key).map(|h| Arc::ptr_eq(h, &handle)).unwrap_or(false) {
                        map.remove(&key);
                    }
                }
                TraceEvent::ZombieCleaned {
                    chat_id: key.clone(),
                }
                .emit();
                continue;
            }

            let mut system_prompt = self.compose_system_prompt(&contact_name, tier, session_type, &source_backend);
            if let Some(summary) = &extra_system_prompt {
                system_prompt = format!("{summary}\n\n{system_prompt}");
            }

            {
                let mut guard = handle.lock().await;
                guard.defer_system_prompt(system_prompt).await;
                let adapter = self.adapter_factory.build();
                let options = policy::build_start_options(
                    tier,
                    cwd.clone(),
                    model.clone(),
                    self.config.session.fallback_model.clone(),
                    self.config.session.max_buffer_size_bytes as usize,
                    resume_id.clone(),
                    None,
                );
                guard.start(adapter, options).await?;
            }

            self.registry.register(
                chat_id,
                session_name.clone(),
                cwd,
                session_type,
                contact_name,
                display_name,
                tier,
                source_backend,
                model,
                resume_id,
                participants,
            )?;

            TraceEvent::SessionCreated {
                chat_id: key,
                session_name,
                tier: tier.as_str().to_string(),
                resumed,
            }
            .emit();

            return Ok(handle);
        }
    }

    fn compose_system_prompt(
        &self,
        contact_name: &str,
        tier: Tier,
        session_type: SessionType,
        source: &str,
    ) -> String {
        match session_type {
            SessionType::Master => {
                "You are the persistent master session. You speak directly for the system owner \
                 and have no tier restrictions."
                    .into()
            }
            SessionType::Background => {
                format!("You are a background task session working on behalf of {contact_name}.")
            }
            _ => format!(
                "You are speaking with {contact_name} over {source}. Their trust tier is {tier}, \
                 which bounds the tools available to you this turn."
            ),
        }
    }

    /// Kill a session if one exists, removing it from the map.
    pub async fn kill_session(&self, chat_id: &ChatId) -> bool {
        let handle = { self.sessions.lock().remove(chat_id.as_str()) };
        match handle {
            Some(handle) => {
                let mut guard = handle.lock().await;
                guard.stop().await;
                true
            }
            None => false,
        }
    }

    /// Kill and recreate a session from its registry snapshot, optionally
    /// overriding its tier (e.g. after a contact's tier changes).
    pub async fn restart_session(
        &self,
        chat_id: &ChatId,
        tier_override: Option<Tier>,
    ) -> Result<Option<SessionInfo>> {
        let prior = match self.registry.get(chat_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        self.kill_session(chat_id).await;

        let tier = tier_override.unwrap_or(prior.tier);
        let handle = self
            .ensure_session(
                chat_id,
                prior.contact_name.clone(),
                tier,
                prior.session_type,
                prior.participants.clone(),
                prior.source_backend.clone(),
                prior.display_name.clone(),
            )
            .await?;

        TraceEvent::SessionRestarted {
            chat_id: chat_id.as_str().to_string(),
            reason: "manual restart".into(),
        }
        .emit();

        Ok(Some(self.session_info(&handle).await))
    }

    pub async fn kill_all_sessions(&self) -> usize {
        let handles: Vec<_> = { self.sessions.lock().drain().map(|(_, v)| v).collect() };
        let count = handles.len();
        for handle in handles {
            let mut guard = handle.lock().await;
            guard.stop().await;
        }
        count
    }

    pub async fn get_all_sessions(&self) -> Vec<SessionInfo> {
        let handles: Vec<_> = { self.sessions.lock().values().cloned().collect() };
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(self.session_info(&handle).await);
        }
        infos
    }

    pub async fn get_session_info(&self, chat_id: &ChatId) -> Option<SessionInfo> {
        let handle = { self.sessions.lock().get(chat_id.as_str()).cloned() }?;
        Some(self.session_info(&handle).await)
    }

    async fn session_info(&self, handle: &Arc<AsyncMutex<Session>>) -> SessionInfo {
        let guard = handle.lock().await;
        let idle_secs = guard.idle_duration().await.as_secs() as i64;
        SessionInfo {
            chat_id: guard.chat_id.as_str().to_string(),
            session_name: guard.session_name.clone(),
            contact_name: guard.contact_name.clone(),
            tier: guard.tier,
            session_type: guard.session_type,
            is_alive: guard.is_alive(),
            pending_queries: guard.pending_queries_count(),
            model: guard.model.clone(),
            idle_secs,
        }
    }

    /// Exposed for the Idle Reaper and Health Supervisor, which need to act
    /// on a session by chat_id without going through the full message-
    /// wrapping path of `inject_message`.
    pub fn chat_id_handle(&self, chat_id: &str) -> Option<Arc<AsyncMutex<Session>>> {
        self.sessions.lock().get(chat_id).cloned()
    }

    /// Exposed for the IPC `set_model` command (§4.8), which updates the
    /// registry entry directly before restarting the session.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Record a cancellation request that didn't match any in-flight tool
    /// call. Returns `false` once the configured ceiling is exceeded, a
    /// structural guard against a runaway client hammering `interrupt`.
    pub fn record_spurious_cancellation(&self) -> bool {
        let count = self.spurious_cancellations.fetch_add(1, Ordering::AcqRel) + 1;
        TraceEvent::SpuriousCancellation { count }.emit();
        count <= self.config.cancellation.spurious_cancel_ceiling
    }

    // ────────────────────────── prompt wrapping ─────────────────────────

    async fn reply_context(&self, chat_id: &ChatId, reply_to_guid: &Option<String>) -> String {
        let Some(guid) = reply_to_guid else {
            return String::new();
        };
        match self.reply_chain.recent_messages(chat_id, guid, REPLY_CHAIN_LIMIT).await {
            Ok(history) if !history.is_empty() => {
                let mut block = String::from("--- reply chain context ---\n");
                for m in history {
                    let who = m.display_name.as_deref().unwrap_or(&m.sender);
                    block.push_str(&format!("{who}: {}\n", m.text));
                }
                block.push_str("--- end context ---\n\n");
                block
            }
            Ok(_) => String::new(),
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "reply chain lookup failed");
                String::new()
            }
        }
    }

    fn attachments_block(attachments: &[Attachment]) -> String {
        if attachments.is_empty() {
            return String::new();
        }
        let mut block = String::from("Attachments:\n");
        for a in attachments {
            block.push_str(&format!(
                "- {} ({}, {} bytes) at {}\n",
                a.name,
                a.mime_type.as_deref().unwrap_or("unknown"),
                a.size_bytes,
                a.path
            ));
        }
        block
    }

    /// Wraps a message body in the `---<BACKEND-LABEL> FROM ...---`/`---END---`
    /// envelope (§4.4 "Prompt wrapping"), with the backend's reply command
    /// substituted from the registry rather than hardcoded.
    fn envelope(&self, backend: &sa_domain::backend::Backend, chat_id: &ChatId, header: &str, body: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("---{} {header}---\n", backend.label));
        out.push_str(&format!("Chat ID: {}\n", chat_id.as_str()));
        out.push_str(body);
        out.push_str("\n---END---\n");
        if let Some(send_cmd) = backend.send_cmd {
            out.push_str(&format!(
                "**Important:** You are in a text-message session. Reply via {send_cmd} \"message\"\n"
            ));
        }
        out
    }

    async fn wrap_individual(&self, message: &Message) -> String {
        let backend = sa_domain::backend::get_backend(&message.source);
        let context = self.reply_context(&message.chat_id, &message.reply_to_guid).await;
        let name = message.display_name.clone().unwrap_or_else(|| message.sender.clone());

        let mut body = String::new();
        body.push_str(&context);
        body.push_str(&message.text);
        if let Some(transcript) = &message.audio_transcription {
            body.push_str(&format!("\n\n[voice message transcript: {transcript}]"));
        }
        let attachments = Self::attachments_block(&message.attachments);
        if !attachments.is_empty() {
            body.push_str("\n\n");
            body.push_str(&attachments);
        }

        self.envelope(
            backend,
            &message.chat_id,
            &format!("FROM {name} ({})", message.tier.as_str()),
            &body,
        )
    }

    async fn wrap_group(&self, message: &Message) -> String {
        let backend = sa_domain::backend::get_backend(&message.source);
        let context = self.reply_context(&message.chat_id, &message.reply_to_guid).await;
        let sender = message.display_name.clone().unwrap_or_else(|| message.sender.clone());

        let mut body = String::new();
        body.push_str(&context);
        body.push_str(&format!("{sender}: {}", message.text));
        if let Some(transcript) = &message.audio_transcription {
            body.push_str(&format!("\n\n[voice message transcript from {sender}: {transcript}]"));
        }
        let attachments = Self::attachments_block(&message.attachments);
        if !attachments.is_empty() {
            body.push_str("\n\n");
            body.push_str(&attachments);
        }

        self.envelope(
            backend,
            &message.chat_id,
            &format!("GROUP FROM {sender} ({})", message.tier.as_str()),
            &body,
        )
    }

    // ─────────────────────────── vision pipeline ────────────────────────

    fn dispatch_vision(&self, chat_id: &ChatId, message: &Message, handle: Arc<AsyncMutex<Session>>) {
        let timeout = Duration::from_secs(self.config.vision.timeout_secs);
        for attachment in &message.attachments {
            if !attachment.is_image() {
                continue;
            }
            let analyzer = self.vision_analyzer.clone();
            let target = handle.clone();
            vision::enrich_async(
                analyzer,
                chat_id.clone(),
                attachment.clone(),
                message.text.clone(),
                timeout,
                move |text| {
                    tokio::spawn(async move {
                        let guard = target.lock().await;
                        let _ = guard.inject(text);
                    });
                },
            );
        }
    }

    // ───────────────────────────── shutdown ─────────────────────────────

    /// Graceful shutdown (§4.7): stop admitting new messages, summarize
    /// every live session concurrently with a bounded timeout, persist each
    /// session's resumable id, then stop and flush.
    pub async fn shutdown(&self) -> Result<()> {
        self.draining.store(true, Ordering::Release);

        let handles: Vec<(String, Arc<AsyncMutex<Session>>)> = {
            self.sessions
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let summarize_timeout = Duration::from_secs(self.config.shutdown.summarize_timeout_secs);
        let mut summarize_tasks = Vec::with_capacity(handles.len());
        for (key, handle) in &handles {
            let summarize = self.summarize.clone();
            let key = key.clone();
            let handle = handle.clone();
            summarize_tasks.push(tokio::spawn(async move {
                let (cwd, session_name) = {
                    let guard = handle.lock().await;
                    (guard.cwd.clone(), guard.session_name.clone())
                };
                match tokio::time::timeout(summarize_timeout, summarize.summarize(&cwd, &session_name)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(chat_id = %key, error = %e, "summarize failed on shutdown");
                    }
                    Err(_) => {
                        tracing::warn!(chat_id = %key, "summarize timed out on shutdown");
                    }
                }
            }));
        }
        for task in summarize_tasks {
            let _ = task.await;
        }

        for (key, handle) in &handles {
            let session_id = { handle.lock().await.session_id().await };
            if let Some(id) = session_id {
                let chat_id = ChatId::from_canonical(key.clone());
                let _ = self.registry.update_session_id(&chat_id, id);
            }
        }

        for (_, handle) in handles {
            let mut guard = handle.lock().await;
            guard.stop().await;
        }

        self.registry.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::fakes::{FakeContactsDirectory, FakeReplyChainReader};
    use chrono::Utc;
    use sa_domain::tier::Tier;
    use sa_sessions::adapter::fake::FakeAgentAdapter;
    use tempfile::tempdir;

    struct NullVision;
    #[async_trait::async_trait]
    impl VisionAnalyzer for NullVision {
        async fn describe(&self, _image_path: &str, _context_prompt: &str) -> Result<String> {
            Ok("nothing".into())
        }
    }

    struct NullSummarize;
    #[async_trait::async_trait]
    impl SummarizeHook for NullSummarize {
        async fn summarize(&self, _cwd: &std::path::Path, _session_name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_message(chat_id: ChatId, tier: Tier, text: &str) -> Message {
        Message {
            chat_id,
            source: "imessage".into(),
            sender: "+15555551234".into(),
            tier,
            display_name: Some("Dave".into()),
            text: text.into(),
            attachments: vec![],
            is_group: false,
            group_name: None,
            audio_transcription: None,
            reply_to_guid: None,
            received_at: Utc::now(),
            native_id: None,
        }
    }

    fn test_orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::load(dir.path().join("registry.json")));
        let contacts = Arc::new(FakeContactsDirectory::default());
        let reply_chain = Arc::new(FakeReplyChainReader { messages: vec![] });
        let vision = Arc::new(NullVision);
        let summarize = Arc::new(NullSummarize);
        let factory: Arc<dyn AgentAdapterFactory> =
            Arc::new(|| Box::new(FakeAgentAdapter::new()) as Box<dyn AgentAdapter>);
        let config = Arc::new(Config::default());
        let orch = Orchestrator::new(
            registry,
            contacts,
            reply_chain,
            vision,
            summarize,
            factory,
            config,
            dir.path().join("workspaces"),
        );
        (orch, dir)
    }

    #[tokio::test]
    async fn individual_message_lazily_creates_a_session() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        let msg = test_message(chat_id.clone(), Tier::Admin, "hello there");
        orch.inject_message(&msg).await.unwrap();

        let info = orch.get_session_info(&chat_id).await.unwrap();
        assert!(info.is_alive);
        assert_eq!(info.tier, Tier::Admin);
    }

    #[tokio::test]
    async fn repeated_message_reuses_the_same_session() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        let msg = test_message(chat_id.clone(), Tier::Admin, "first");
        orch.inject_message(&msg).await.unwrap();
        orch.inject_message(&test_message(chat_id.clone(), Tier::Admin, "second"))
            .await
            .unwrap();

        assert_eq!(orch.get_all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_payload_is_dropped_without_creating_a_session() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        let msg = test_message(chat_id.clone(), Tier::Admin, "   ");
        orch.inject_message(&msg).await.unwrap();

        assert!(orch.get_session_info(&chat_id).await.is_none());
    }

    #[tokio::test]
    async fn unblessed_group_with_no_existing_session_is_dropped() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "abcdef0123456789abcdef01");
        let mut msg = test_message(chat_id.clone(), Tier::Unknown, "hi group");
        msg.is_group = true;
        orch.inject_group_message(&msg, &["+19999999999".into()]).await.unwrap();

        assert!(orch.get_session_info(&chat_id).await.is_none());
    }

    #[tokio::test]
    async fn blessed_group_participant_admits_the_group() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::load(dir.path().join("registry.json")));
        let contacts = Arc::new(FakeContactsDirectory {
            blessed_groups: true,
            ..Default::default()
        });
        let reply_chain = Arc::new(FakeReplyChainReader { messages: vec![] });
        let vision = Arc::new(NullVision);
        let summarize = Arc::new(NullSummarize);
        let factory: Arc<dyn AgentAdapterFactory> =
            Arc::new(|| Box::new(FakeAgentAdapter::new()) as Box<dyn AgentAdapter>);
        let config = Arc::new(Config::default());
        let orch = Orchestrator::new(
            registry,
            contacts,
            reply_chain,
            vision,
            summarize,
            factory,
            config,
            dir.path().join("workspaces"),
        );

        let chat_id = ChatId::new("", "abcdef0123456789abcdef01");
        let mut msg = test_message(chat_id.clone(), Tier::Family, "hi group");
        msg.is_group = true;
        orch.inject_group_message(&msg, &["+15555551234".into()]).await.unwrap();

        let info = orch.get_session_info(&chat_id).await.unwrap();
        assert_eq!(info.session_type, SessionType::Group);
        assert_eq!(info.tier, Tier::Admin);
    }

    #[tokio::test]
    async fn kill_session_removes_it() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Admin, "hi"))
            .await
            .unwrap();
        assert!(orch.kill_session(&chat_id).await);
        assert!(orch.get_session_info(&chat_id).await.is_none());
        assert!(!orch.kill_session(&chat_id).await);
    }

    #[tokio::test]
    async fn restart_recreates_from_registry_snapshot() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Family, "hi"))
            .await
            .unwrap();

        let restarted = orch.restart_session(&chat_id, None).await.unwrap().unwrap();
        assert_eq!(restarted.tier, Tier::Family);
        assert!(restarted.is_alive);
    }

    #[tokio::test]
    async fn restart_with_tier_override_changes_tier() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Family, "hi"))
            .await
            .unwrap();

        let restarted = orch
            .restart_session(&chat_id, Some(Tier::Favorite))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(restarted.tier, Tier::Favorite);
    }

    #[tokio::test]
    async fn restart_of_unknown_chat_is_none() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555559999");
        assert!(orch.restart_session(&chat_id, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kill_all_sessions_empties_the_map() {
        let (orch, _dir) = test_orchestrator();
        orch.inject_message(&test_message(ChatId::new("", "+15555551111"), Tier::Admin, "a"))
            .await
            .unwrap();
        orch.inject_message(&test_message(ChatId::new("", "+15555552222"), Tier::Admin, "b"))
            .await
            .unwrap();

        assert_eq!(orch.kill_all_sessions().await, 2);
        assert!(orch.get_all_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn admin_healme_spawns_an_ephemeral_background_session_without_touching_the_dm() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Admin, "HEALME things are slow"))
            .await
            .unwrap();

        // The HEALME intercept never creates a session for the originating
        // chat_id itself — it spawns a separate ephemeral one.
        assert!(orch.get_session_info(&chat_id).await.is_none());
        assert_eq!(orch.get_all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn non_admin_sender_cannot_trigger_an_intercept() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Family, "RESTART"))
            .await
            .unwrap();

        // Treated as an ordinary message, not an intercept: a session for
        // this chat_id is created and carries the literal text.
        let info = orch.get_session_info(&chat_id).await.unwrap();
        assert_eq!(info.tier, Tier::Family);
    }

    #[tokio::test]
    async fn spurious_cancellation_ceiling_is_enforced() {
        let (orch, _dir) = test_orchestrator();
        for _ in 0..500 {
            assert!(orch.record_spurious_cancellation());
        }
        assert!(!orch.record_spurious_cancellation());
    }

    #[tokio::test]
    async fn concurrent_first_messages_for_a_new_chat_id_create_one_session() {
        let (orch, _dir) = test_orchestrator();
        let orch = Arc::new(orch);
        let chat_id = ChatId::new("", "+15555559876");

        let mut tasks = Vec::new();
        for i in 0..8 {
            let orch = orch.clone();
            let chat_id = chat_id.clone();
            tasks.push(tokio::spawn(async move {
                let msg = test_message(chat_id, Tier::Admin, &format!("concurrent {i}"));
                orch.inject_message(&msg).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(orch.get_all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn resume_pending_summaries_recreates_session_and_unlinks_marker() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555557777");

        // A prior session's registry entry, as if left by a previous run.
        let cwd = _dir.path().join("workspaces").join("imessage/_15555557777");
        std::fs::create_dir_all(&cwd).unwrap();
        std::fs::write(cwd.join(PENDING_SUMMARY_FILENAME), "last time: discussed the trip").unwrap();
        orch.registry
            .register(
                &chat_id,
                "imessage/_15555557777".into(),
                cwd.clone(),
                SessionType::Individual,
                "Dave".into(),
                Some("Dave".into()),
                Tier::Admin,
                "imessage".into(),
                "opus".into(),
                None,
                vec![],
            )
            .unwrap();

        let resumed = orch.resume_pending_summaries().await.unwrap();
        assert_eq!(resumed, 1);
        assert!(orch.get_session_info(&chat_id).await.unwrap().is_alive);
        assert!(!cwd.join(PENDING_SUMMARY_FILENAME).exists());
    }

    #[tokio::test]
    async fn resume_pending_summaries_skips_entries_without_a_marker_file() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555558888");
        let cwd = _dir.path().join("workspaces").join("imessage/_15555558888");
        std::fs::create_dir_all(&cwd).unwrap();
        orch.registry
            .register(
                &chat_id,
                "imessage/_15555558888".into(),
                cwd,
                SessionType::Individual,
                "Dave".into(),
                Some("Dave".into()),
                Tier::Admin,
                "imessage".into(),
                "opus".into(),
                None,
                vec![],
            )
            .unwrap();

        let resumed = orch.resume_pending_summaries().await.unwrap();
        assert_eq!(resumed, 0);
        assert!(orch.get_session_info(&chat_id).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_flushes_registry_and_kills_sessions() {
        let (orch, _dir) = test_orchestrator();
        let chat_id = ChatId::new("", "+15555551234");
        orch.inject_message(&test_message(chat_id.clone(), Tier::Admin, "hi"))
            .await
            .unwrap();

        orch.shutdown().await.unwrap();
        assert!(orch.get_all_sessions().await.is_empty());

        // Draining flag now rejects new messages.
        let err = orch
            .inject_message(&test_message(chat_id, Tier::Admin, "too late"))
            .await;
        assert!(err.is_err());
    }
}
