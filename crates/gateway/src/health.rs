//! Two-tier Health Supervisor (§4.5): detects sessions whose conversation
//! context is corrupted beyond recovery and restarts them with resume.
//!
//! Tier 1 (fast, every `tier1_interval_secs`) regex-scans the tail of each
//! session's transcript for patterns that are fatal because the bad
//! content is already baked into the conversation record — retrying just
//! re-sends it. Tier 2 (deep, every `tier2_interval_secs`) hands the last
//! few minutes of assistant output to a classifier for sessions Tier 1
//! didn't already catch. Both share a "recently healed" TTL set so neither
//! double-restarts a session the other just fixed.
//!
//! `[SUPPLEMENT, grounded in original_source/assistant/health.py
//! FATAL_PATTERNS]`: the exact pattern list and labels below.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::RegexSet;

use sa_domain::chat_id::ChatId;
use sa_domain::config::HealthConfig;
use sa_domain::error::Result;
use sa_domain::trace::TraceEvent;
use sa_sessions::adapter::{AgentAdapter, AgentMessage, AgentStartOptions};
use sa_sessions::registry::SessionType;
use sa_sessions::TranscriptReader;

use crate::interfaces::HealthClassifier;
use crate::orchestrator::{AgentAdapterFactory, Orchestrator, SessionInfo};

/// `[SUPPLEMENT, grounded in original_source/assistant/health.py
/// HAIKU_PROMPT]`: the exact Tier 2 classification prompt, verbatim down to
/// the FATAL/HEALTHY criteria, so the classifier's behavior matches the
/// original system's.
const HAIKU_PROMPT: &str = r#"You are a session health monitor for an AI assistant that communicates with users via SMS. Analyze these recent assistant messages and determine if the session needs intervention.

FATAL means the session is broken and needs a restart:
- API errors baked into conversation context (image dimensions, context length, invalid content) that will repeat on every retry
- Authentication or billing errors
- Repeated identical errors with no progress between them (same error 2+ times)
- Session crashed mid-task and never sent the user a response — the user is left hanging with no reply
- Session is stuck in a loop doing the same thing repeatedly without making progress

HEALTHY means the session is operating normally:
- Rate limits (429) or server overload (529) — these are transient
- Tool execution failures where Claude tries alternatives
- Normal error handling and recovery
- A single error followed by successful work
- Session is actively working on a task and making progress

Recent assistant messages (last 5 minutes):
{messages}

Respond with ONLY one of:
FATAL: <one-line reason>
HEALTHY"#;

/// Concrete [`HealthClassifier`] for production use: a one-shot,
/// `max_turns = 1`, bypass-permissions query over the same
/// [`AgentAdapter`] abstraction ordinary sessions use, rather than a
/// second bespoke HTTP client to a model API.
pub struct AdapterClassifier {
    adapter_factory: Arc<dyn AgentAdapterFactory>,
    scratch_cwd: PathBuf,
    model: String,
    max_buffer_bytes: usize,
}

impl AdapterClassifier {
    pub fn new(adapter_factory: Arc<dyn AgentAdapterFactory>, scratch_cwd: PathBuf, model: String, max_buffer_bytes: usize) -> Self {
        Self {
            adapter_factory,
            scratch_cwd,
            model,
            max_buffer_bytes,
        }
    }
}

#[async_trait::async_trait]
impl HealthClassifier for AdapterClassifier {
    async fn classify(&self, recent_assistant_output: &str) -> Result<Option<String>> {
        let trimmed = recent_assistant_output.trim();
        if trimmed.len() < 20 {
            return Ok(None);
        }

        let mut adapter = self.adapter_factory.build();
        let options = AgentStartOptions {
            cwd: self.scratch_cwd.clone(),
            allowed_tools: vec![],
            bypass_permissions: true,
            model: self.model.clone(),
            fallback_model: None,
            max_turns: 1,
            max_buffer_bytes: self.max_buffer_bytes,
            resume_session_id: None,
            fresh_session_id: Some(uuid::Uuid::new_v4().to_string()),
            system_prompt: None,
        };
        adapter.connect(options).await?;

        let prompt = HAIKU_PROMPT.replace("{messages}", trimmed);
        adapter.query(&prompt).await?;

        let mut result_text = String::new();
        loop {
            match adapter.receive_message().await? {
                Some(AgentMessage::AssistantTextBlock { text }) => result_text.push_str(&text),
                Some(AgentMessage::ResultToken { .. }) => break,
                Some(_) => {}
                None => break,
            }
        }
        adapter.disconnect().await;

        let result = result_text.trim();
        Ok(result.strip_prefix("FATAL:").map(|reason| reason.trim().to_string()))
    }
}

/// Case-insensitive fatal patterns paired with their trace-event label,
/// compiled once into a single `RegexSet` (teacher precedent:
/// `denied_command_set`/`approval_command_set` in the original
/// `sa-gateway/src/main.rs`).
const FATAL_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)API Error: 400.*invalid_request_error", "invalid_request_400"),
    (r"(?i)image dimensions exceed max allowed size", "image_too_large"),
    (r"(?i)context_length_exceeded", "context_too_long"),
    (r"(?i)prompt is too long", "prompt_too_long"),
    (r#"(?i)"authentication_failed""#, "auth_failed"),
    (r#"(?i)"billing_error""#, "billing_error"),
    (r"(?i)content size exceeds", "content_too_large"),
];

fn is_exempt(info: &SessionInfo) -> bool {
    matches!(info.session_type, SessionType::Background | SessionType::Master)
}

pub struct HealthSupervisor {
    orchestrator: Arc<Orchestrator>,
    transcripts: Arc<TranscriptReader>,
    classifier: Arc<dyn HealthClassifier>,
    config: HealthConfig,
    recently_healed: Mutex<HashMap<String, Instant>>,
    fatal_patterns: RegexSet,
    fatal_labels: Vec<&'static str>,
}

impl HealthSupervisor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        transcripts: Arc<TranscriptReader>,
        classifier: Arc<dyn HealthClassifier>,
        config: HealthConfig,
    ) -> Self {
        let fatal_patterns = RegexSet::new(FATAL_PATTERNS.iter().map(|(p, _)| *p))
            .expect("fatal health patterns must compile");
        let fatal_labels = FATAL_PATTERNS.iter().map(|(_, label)| *label).collect();
        Self {
            orchestrator,
            transcripts,
            classifier,
            config,
            recently_healed: Mutex::new(HashMap::new()),
            fatal_patterns,
            fatal_labels,
        }
    }

    /// Spawn the Tier 1 and Tier 2 scan loops as detached tasks.
    pub fn spawn(self: Arc<Self>) {
        let tier1 = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tier1.config.tier1_interval_secs));
            loop {
                interval.tick().await;
                tier1.tier1_scan().await;
            }
        });

        let tier2 = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tier2.config.tier2_interval_secs));
            loop {
                interval.tick().await;
                tier2.tier2_scan().await;
            }
        });
    }

    async fn tier1_scan(&self) {
        for info in self.orchestrator.get_all_sessions().await {
            if is_exempt(&info) {
                continue;
            }
            if self.is_recently_healed(&info.chat_id) {
                TraceEvent::RecentlyHealedSkip {
                    chat_id: info.chat_id.clone(),
                    tier: 1,
                }
                .emit();
                continue;
            }

            if !info.is_alive {
                self.trigger_restart(&info.chat_id, "dead_session".into());
                continue;
            }

            let tail = match self.transcripts.tail_raw(&info.session_name) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(chat_id = %info.chat_id, error = %e, "tier1: transcript read failed");
                    continue;
                }
            };
            if let Some(idx) = self.fatal_patterns.matches(&tail).into_iter().next() {
                let label = self.fatal_labels[idx];
                TraceEvent::HealthTier1Fatal {
                    chat_id: info.chat_id.clone(),
                    pattern: label.to_string(),
                }
                .emit();
                self.trigger_restart(&info.chat_id, label.to_string());
            }
        }
    }

    async fn tier2_scan(&self) {
        let lookback = chrono::Duration::seconds(self.config.tier2_lookback_secs as i64);
        for info in self.orchestrator.get_all_sessions().await {
            if is_exempt(&info) || !info.is_alive {
                continue;
            }
            if self.is_recently_healed(&info.chat_id) {
                TraceEvent::RecentlyHealedSkip {
                    chat_id: info.chat_id.clone(),
                    tier: 2,
                }
                .emit();
                continue;
            }

            let recent = match self.transcripts.recent_assistant_text(&info.session_name, lookback) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(chat_id = %info.chat_id, error = %e, "tier2: transcript read failed");
                    continue;
                }
            };
            if recent.trim().is_empty() {
                continue;
            }

            match self.classifier.classify(&recent).await {
                Ok(Some(reason)) => {
                    TraceEvent::HealthTier2Fatal {
                        chat_id: info.chat_id.clone(),
                        reason: reason.clone(),
                    }
                    .emit();
                    self.trigger_restart(&info.chat_id, reason);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(chat_id = %info.chat_id, error = %e, "tier2: classifier call failed");
                }
            }
        }
    }

    fn is_recently_healed(&self, chat_id: &str) -> bool {
        let ttl = Duration::from_secs(self.config.recently_healed_ttl_secs);
        self.recently_healed
            .lock()
            .get(chat_id)
            .map(|marked_at| marked_at.elapsed() < ttl)
            .unwrap_or(false)
    }

    /// Mark healed immediately (so the other tier skips it this cycle) and
    /// fire the restart as a detached task so a slow restart never blocks
    /// the scan loop (§4.5 "Restarts are fired as isolated tasks").
    fn trigger_restart(&self, chat_id: &str, reason: String) {
        self.recently_healed
            .lock()
            .insert(chat_id.to_string(), Instant::now());

        let orchestrator = self.orchestrator.clone();
        let chat_id = ChatId::from_canonical(chat_id.to_string());
        tokio::spawn(async move {
            match orchestrator.restart_session(&chat_id, None).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::warn!(chat_id = %chat_id, reason, "health: restart skipped, no registry entry");
                }
                Err(e) => {
                    tracing::warn!(chat_id = %chat_id, reason, error = %e, "health: restart failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::fakes::{FakeClassifier, FakeContactsDirectory, FakeReplyChainReader};
    use crate::orchestrator::Orchestrator;
    use sa_domain::config::Config;
    use sa_domain::message::Message;
    use sa_domain::tier::Tier;
    use sa_sessions::adapter::fake::FakeAgentAdapter;

    struct NullSummarize;
    #[async_trait::async_trait]
    impl crate::interfaces::SummarizeHook for NullSummarize {
        async fn summarize(&self, _cwd: &std::path::Path, _session_name: &str) -> sa_domain::error::Result<()> {
            Ok(())
        }
    }
    struct NullVision;
    #[async_trait::async_trait]
    impl crate::interfaces::VisionAnalyzer for NullVision {
        async fn describe(&self, _p: &str, _c: &str) -> sa_domain::error::Result<String> {
            Ok("n/a".into())
        }
    }

    fn test_orchestrator(dir: &std::path::Path) -> Arc<Orchestrator> {
        let registry = Arc::new(sa_sessions::SessionRegistry::load(dir.join("registry.json")));
        Arc::new(Orchestrator::new(
            registry,
            Arc::new(FakeContactsDirectory::default()),
            Arc::new(FakeReplyChainReader { messages: vec![] }),
            Arc::new(NullVision),
            Arc::new(NullSummarize),
            Arc::new(|| Box::new(FakeAgentAdapter::new()) as Box<dyn sa_sessions::AgentAdapter>),
            Arc::new(Config::default()),
            dir.join("sessions"),
        ))
    }

    fn test_message(chat_id: ChatId, text: &str) -> Message {
        Message {
            chat_id,
            source: "imessage".into(),
            sender: "+15555551234".into(),
            tier: Tier::Admin,
            display_name: Some("Dave".into()),
            text: text.into(),
            attachments: vec![],
            is_group: false,
            group_name: None,
            audio_transcription: None,
            reply_to_guid: None,
            received_at: chrono::Utc::now(),
            native_id: None,
        }
    }

    #[tokio::test]
    async fn tier1_restarts_session_whose_transcript_has_fatal_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "+15555551111");
        orchestrator.inject_message(&test_message(chat_id.clone(), "hi")).await.unwrap();

        let session_name = orchestrator.get_session_info(&chat_id).await.unwrap().session_name;
        let transcripts = Arc::new(TranscriptReader::new(dir.path().join("transcripts")));
        let writer = sa_sessions::TranscriptWriter::new(dir.path().join("transcripts"));
        writer
            .append(&session_name, "system", "API Error: 400 invalid_request_error: bad image")
            .unwrap();

        let supervisor = Arc::new(HealthSupervisor::new(
            orchestrator.clone(),
            transcripts,
            Arc::new(FakeClassifier { verdict: None }),
            HealthConfig::default(),
        ));
        supervisor.tier1_scan().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.is_recently_healed(chat_id.as_str()));
    }

    #[tokio::test]
    async fn tier1_skips_recently_healed_session() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let transcripts = Arc::new(TranscriptReader::new(dir.path().join("transcripts")));
        let supervisor = HealthSupervisor::new(
            orchestrator,
            transcripts,
            Arc::new(FakeClassifier { verdict: None }),
            HealthConfig::default(),
        );
        supervisor
            .recently_healed
            .lock()
            .insert("imessage/+15555552222".into(), Instant::now());
        assert!(supervisor.is_recently_healed("imessage/+15555552222"));
    }

    #[tokio::test]
    async fn tier2_triggers_restart_on_fatal_classification() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "+15555553333");
        orchestrator.inject_message(&test_message(chat_id.clone(), "hi")).await.unwrap();
        let session_name = orchestrator.get_session_info(&chat_id).await.unwrap().session_name;

        let base = dir.path().join("transcripts");
        let writer = sa_sessions::TranscriptWriter::new(&base);
        writer.append(&session_name, "assistant", "looping on the same tool call forever").unwrap();

        let supervisor = Arc::new(HealthSupervisor::new(
            orchestrator.clone(),
            Arc::new(TranscriptReader::new(&base)),
            Arc::new(FakeClassifier { verdict: Some("looping".into()) }),
            HealthConfig::default(),
        ));
        supervisor.tier2_scan().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.is_recently_healed(chat_id.as_str()));
    }

    #[tokio::test]
    async fn background_sessions_are_exempt() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "bg-job-1");
        orchestrator
            .inject_consolidation("Dave", &chat_id)
            .await
            .unwrap();
        let session_name = orchestrator.get_session_info(&chat_id).await.unwrap().session_name;

        let base = dir.path().join("transcripts");
        let writer = sa_sessions::TranscriptWriter::new(&base);
        writer.append(&session_name, "system", "authentication_failed").unwrap();

        let supervisor = Arc::new(HealthSupervisor::new(
            orchestrator.clone(),
            Arc::new(TranscriptReader::new(&base)),
            Arc::new(FakeClassifier { verdict: None }),
            HealthConfig::default(),
        ));
        supervisor.tier1_scan().await;

        assert!(!supervisor.is_recently_healed(chat_id.as_str()));
    }

    #[tokio::test]
    async fn adapter_classifier_parses_fatal_response() {
        let factory: Arc<dyn crate::orchestrator::AgentAdapterFactory> = Arc::new(|| {
            let mut adapter = FakeAgentAdapter::new();
            adapter.push(AgentMessage::AssistantTextBlock {
                text: "FATAL: stuck retrying the same tool call".into(),
            });
            adapter.push(AgentMessage::ResultToken {
                is_error: false,
                session_id: None,
            });
            Box::new(adapter) as Box<dyn sa_sessions::AgentAdapter>
        });
        let classifier = AdapterClassifier::new(factory, std::env::temp_dir(), "haiku".into(), 1024 * 1024);

        let verdict = classifier.classify("assistant kept retrying the exact same Bash call").await.unwrap();
        assert_eq!(verdict, Some("stuck retrying the same tool call".into()));
    }

    #[tokio::test]
    async fn adapter_classifier_parses_healthy_response() {
        let factory: Arc<dyn crate::orchestrator::AgentAdapterFactory> = Arc::new(|| {
            let mut adapter = FakeAgentAdapter::new();
            adapter.push(AgentMessage::AssistantTextBlock { text: "HEALTHY".into() });
            adapter.push(AgentMessage::ResultToken {
                is_error: false,
                session_id: None,
            });
            Box::new(adapter) as Box<dyn sa_sessions::AgentAdapter>
        });
        let classifier = AdapterClassifier::new(factory, std::env::temp_dir(), "haiku".into(), 1024 * 1024);

        let verdict = classifier.classify("making steady progress on the task").await.unwrap();
        assert_eq!(verdict, None);
    }

    #[tokio::test]
    async fn adapter_classifier_skips_classification_for_short_input() {
        let factory: Arc<dyn crate::orchestrator::AgentAdapterFactory> =
            Arc::new(|| Box::new(FakeAgentAdapter::new()) as Box<dyn sa_sessions::AgentAdapter>);
        let classifier = AdapterClassifier::new(factory, std::env::temp_dir(), "haiku".into(), 1024 * 1024);

        let verdict = classifier.classify("ok").await.unwrap();
        assert_eq!(verdict, None);
    }
}
