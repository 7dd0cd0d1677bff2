//! Injected boundaries to collaborators the orchestrator consumes but does
//! not own: the contacts directory, reply-chain reads, the vision CLI, and
//! the shutdown-time summarize helper (§1 "Out of scope", §9 Open Question
//! #3). Kept as trait objects so the orchestrator never assumes a concrete
//! backend (SQLite, a specific CLI, etc).

use async_trait::async_trait;

use sa_domain::chat_id::ChatId;
use sa_domain::error::Result;
use sa_domain::message::Message;
use sa_domain::tier::Tier;

/// Snapshot of a contact, as the orchestrator needs it for tier resolution
/// and group admission.
#[derive(Debug, Clone)]
pub struct Contact {
    pub bare_id: String,
    pub display_name: String,
    pub tier: Tier,
}

/// Read-only view over the contacts directory (a SQLite snapshot in the
/// original system; here, any injected source).
#[async_trait]
pub trait ContactsDirectory: Send + Sync {
    /// Resolve a sender's tier, defaulting to `Tier::Unknown` if not found.
    async fn tier_of(&self, bare_id: &str) -> Tier;

    async fn display_name_of(&self, bare_id: &str) -> Option<String>;

    /// `true` iff any participant of the given group resolves to a blessed
    /// tier (§4.4 "Group admission").
    async fn group_has_blessed_participant(&self, participants: &[String]) -> bool;
}

/// Reads recent messages from a backend's own message store, for reply-
/// chain expansion (§4.4, §9 Open Question #3). `before` is the guid being
/// replied to; the result excludes that message itself and is ordered
/// oldest-to-newest, capped at `limit`.
#[async_trait]
pub trait ReplyChainReader: Send + Sync {
    async fn recent_messages(
        &self,
        chat_id: &ChatId,
        before: &str,
        limit: usize,
    ) -> Result<Vec<Message>>;
}

/// Image-description CLI, invoked fire-and-forget by the vision pipeline
/// (§4.4 "Vision pipeline").
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn describe(&self, image_path: &str, context_prompt: &str) -> Result<String>;
}

/// External per-session summarizer, invoked on shutdown (§4.7) to write a
/// `.pending-summary.md` file consumed on next startup.
#[async_trait]
pub trait SummarizeHook: Send + Sync {
    async fn summarize(&self, cwd: &std::path::Path, session_name: &str) -> Result<()>;
}

/// Tier 2 deep health classifier (§4.5): given the last few minutes of a
/// session's assistant output, decide whether it is stuck in a way that
/// retrying cannot fix. `Ok(Some(reason))` means FATAL; `Ok(None)` means
/// HEALTHY. Implemented over the same `AgentAdapter` abstraction ordinary
/// sessions use (§4.5 "one subprocess-adapter abstraction"), not a second
/// bespoke HTTP client.
#[async_trait]
pub trait HealthClassifier: Send + Sync {
    async fn classify(&self, recent_assistant_output: &str) -> Result<Option<String>>;
}

/// Default `ContactsDirectory`: resolves only the configured owner to
/// `Tier::Admin`, everyone else to `Tier::Unknown`. A real deployment that
/// wants favorite/family/wife tiers wires its own contacts backend; the
/// spec does not mandate a particular storage (§9 "Open questions").
pub struct ConfigContactsDirectory {
    owner_phone: String,
    owner_name: String,
}

impl ConfigContactsDirectory {
    pub fn new(owner_phone: String, owner_name: String) -> Self {
        Self { owner_phone, owner_name }
    }
}

#[async_trait]
impl ContactsDirectory for ConfigContactsDirectory {
    async fn tier_of(&self, bare_id: &str) -> Tier {
        if bare_id == self.owner_phone {
            Tier::Admin
        } else {
            Tier::Unknown
        }
    }

    async fn display_name_of(&self, bare_id: &str) -> Option<String> {
        (bare_id == self.owner_phone).then(|| self.owner_name.clone())
    }

    async fn group_has_blessed_participant(&self, participants: &[String]) -> bool {
        participants.iter().any(|p| p == &self.owner_phone)
    }
}

/// Default `ReplyChainReader` (§9 Open Question #3): "the default
/// implementation bundled in this crate is an in-memory/test double, not a
/// SQLite reader" — a backend that wants reply-chain expansion supplies its
/// own reader over its own message store.
pub struct InMemoryReplyChainReader;

#[async_trait]
impl ReplyChainReader for InMemoryReplyChainReader {
    async fn recent_messages(&self, _chat_id: &ChatId, _before: &str, _limit: usize) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }
}

/// Default `VisionAnalyzer`: the vision CLI is an external subprocess out
/// of this crate's core design (§9 "External subprocesses"); absent a
/// configured one, every attachment enrichment fails closed and silently
/// (`vision::enrich_async` already treats analyzer errors as a logged
/// no-op, never surfaced to the conversation).
pub struct DisabledVisionAnalyzer;

#[async_trait]
impl VisionAnalyzer for DisabledVisionAnalyzer {
    async fn describe(&self, _image_path: &str, _context_prompt: &str) -> Result<String> {
        Err(sa_domain::error::Error::Other("no vision analyzer configured".into()))
    }
}

/// Default `SummarizeHook`: a no-op. Real deployments that want a
/// `.pending-summary.md` written on shutdown supply their own hook calling
/// out to an external summarizer CLI.
pub struct NoopSummarizeHook;

#[async_trait]
impl SummarizeHook for NoopSummarizeHook {
    async fn summarize(&self, _cwd: &std::path::Path, _session_name: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeContactsDirectory {
        pub tiers: HashMap<String, Tier>,
        pub names: HashMap<String, String>,
        pub blessed_groups: bool,
    }

    #[async_trait]
    impl ContactsDirectory for FakeContactsDirectory {
        async fn tier_of(&self, bare_id: &str) -> Tier {
            self.tiers.get(bare_id).copied().unwrap_or(Tier::Unknown)
        }

        async fn display_name_of(&self, bare_id: &str) -> Option<String> {
            self.names.get(bare_id).cloned()
        }

        async fn group_has_blessed_participant(&self, _participants: &[String]) -> bool {
            self.blessed_groups
        }
    }

    pub struct FakeReplyChainReader {
        pub messages: Vec<Message>,
    }

    #[async_trait]
    impl ReplyChainReader for FakeReplyChainReader {
        async fn recent_messages(
            &self,
            _chat_id: &ChatId,
            _before: &str,
            limit: usize,
        ) -> Result<Vec<Message>> {
            Ok(self.messages.iter().rev().take(limit).rev().cloned().collect())
        }
    }

    pub struct FakeClassifier {
        pub verdict: Option<String>,
    }

    #[async_trait]
    impl super::HealthClassifier for FakeClassifier {
        async fn classify(&self, _recent_assistant_output: &str) -> Result<Option<String>> {
            Ok(self.verdict.clone())
        }
    }
}
