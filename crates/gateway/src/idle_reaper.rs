//! Idle Reaper (§4.6): kills sessions that have gone quiet past a
//! threshold, freeing the subprocess and letting the next message recreate
//! the session lazily. Background and master sessions are exempt — they
//! are expected to sit idle between runs.

use std::sync::Arc;
use std::time::Duration;

use sa_domain::chat_id::ChatId;
use sa_domain::config::IdleReaperConfig;
use sa_domain::trace::TraceEvent;
use sa_sessions::registry::SessionType;

use crate::orchestrator::Orchestrator;

pub struct IdleReaper {
    orchestrator: Arc<Orchestrator>,
    config: IdleReaperConfig,
}

impl IdleReaper {
    pub fn new(orchestrator: Arc<Orchestrator>, config: IdleReaperConfig) -> Self {
        Self { orchestrator, config }
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.scan_interval_secs));
            loop {
                interval.tick().await;
                self.scan().await;
            }
        });
    }

    /// Snapshot the session map via `get_all_sessions` (itself lock-then-
    /// release, never held across awaits), then fire detached kill tasks
    /// without the caller holding anything (§4.6, §5 "iterate without the
    /// lock").
    async fn scan(&self) {
        let threshold = self.config.threshold_secs;
        for info in self.orchestrator.get_all_sessions().await {
            if matches!(info.session_type, SessionType::Background | SessionType::Master) {
                continue;
            }
            if info.idle_secs <= threshold {
                continue;
            }

            TraceEvent::IdleReaped {
                chat_id: info.chat_id.clone(),
                idle_secs: info.idle_secs,
            }
            .emit();

            let orchestrator = self.orchestrator.clone();
            let chat_id = ChatId::from_canonical(info.chat_id);
            tokio::spawn(async move {
                orchestrator.kill_session(&chat_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::fakes::{FakeContactsDirectory, FakeReplyChainReader};
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

    fn test_message(chat_id: ChatId) -> Message {
        Message {
            chat_id,
            source: "imessage".into(),
            sender: "+15555551234".into(),
            tier: Tier::Admin,
            display_name: Some("Dave".into()),
            text: "hi".into(),
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
    async fn fresh_session_is_not_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "+15555551234");
        orchestrator.inject_message(&test_message(chat_id.clone())).await.unwrap();

        let reaper = IdleReaper::new(orchestrator.clone(), IdleReaperConfig::default());
        reaper.scan().await;

        assert!(orchestrator.get_session_info(&chat_id).await.unwrap().is_alive);
    }

    #[tokio::test]
    async fn background_session_is_exempt_even_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "bg-1");
        orchestrator.inject_consolidation("Dave", &chat_id).await.unwrap();

        let reaper = IdleReaper::new(
            orchestrator.clone(),
            IdleReaperConfig {
                scan_interval_secs: 300,
                threshold_secs: -1, // any positive idle time exceeds this
            },
        );
        reaper.scan().await;

        assert!(orchestrator.get_session_info(&chat_id).await.unwrap().is_alive);
    }

    #[tokio::test]
    async fn past_threshold_session_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = test_orchestrator(dir.path());
        let chat_id = ChatId::new("", "+15555559999");
        orchestrator.inject_message(&test_message(chat_id.clone())).await.unwrap();

        let reaper = IdleReaper::new(
            orchestrator.clone(),
            IdleReaperConfig {
                scan_interval_secs: 300,
                threshold_secs: -1,
            },
        );
        reaper.scan().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(orchestrator.get_session_info(&chat_id).await.is_none());
    }
}
