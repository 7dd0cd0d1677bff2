//! Durable `ChatId → RegistryEntry` map with atomic, debounced persistence.
//!
//! Mirrors the teacher's `sa-sessions::store::SessionStore` shape (an
//! `RwLock<HashMap<_, _>>` guarding an on-disk JSON file) but adds the
//! write-to-temp-then-rename-under-advisory-lock durability the orchestrator
//! spec requires (§4.1), grounded in the teacher's `cli::pid` use of `fs2`
//! advisory locks for exactly-one-writer guarantees.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sa_domain::chat_id::ChatId;
use sa_domain::error::{Error, Result};
use sa_domain::tier::Tier;
use sa_domain::trace::TraceEvent;

/// What kind of session a registry entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Individual,
    Group,
    Background,
    Master,
}

/// Persisted snapshot of a [`crate::session::Session`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub chat_id: ChatId,
    pub session_name: String,
    pub cwd: PathBuf,
    pub session_type: SessionType,
    pub contact_name: String,
    pub display_name: Option<String>,
    pub tier: Tier,
    pub source_backend: String,
    pub model: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_time: Option<DateTime<Utc>>,
}

/// Derive the filesystem-safe session name `"<backend>/<sanitized chat_id>"`
/// (§3 "SessionName lifecycle").
pub fn derive_session_name(backend: &str, chat_id: &ChatId) -> String {
    format!("{backend}/{}", chat_id.sanitized())
}

#[derive(Debug, Clone, Default)]
struct OnDiskFile {
    entries: HashMap<String, RegistryEntry>,
}

/// Durable registry: in-memory `HashMap` backed by a JSON file, written via
/// temp-file + atomic rename under an advisory exclusive lock. Writes
/// triggered only by `update_last_message_time` are debounced to at most one
/// flush per second; every other mutation flushes immediately since it is
/// already rare (session create/restart/kill).
pub struct SessionRegistry {
    path: PathBuf,
    entries: RwLock<HashMap<String, RegistryEntry>>,
    dirty: AtomicBool,
}

impl SessionRegistry {
    /// Load the registry file at `path`, treating a missing or corrupt file
    /// as empty (logged, per §4.1 "Failure semantics").
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, RegistryEntry>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "registry file corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        tracing::info!(entries = entries.len(), path = %path.display(), "registry loaded");
        Self {
            path,
            entries: RwLock::new(entries),
            dirty: AtomicBool::new(false),
        }
    }

    /// Idempotent create-or-update, keyed by `chat_id`'s canonical string.
    /// Preserves `created_at` of any prior entry for the same chat_id.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        chat_id: &ChatId,
        session_name: String,
        cwd: PathBuf,
        session_type: SessionType,
        contact_name: String,
        display_name: Option<String>,
        tier: Tier,
        source_backend: String,
        model: String,
        session_id: Option<String>,
        participants: Vec<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let key = chat_id.as_str().to_string();
        {
            let mut entries = self.entries.write();
            let created_at = entries.get(&key).map(|e| e.created_at).unwrap_or(now);
            entries.insert(
                key,
                RegistryEntry {
                    chat_id: chat_id.clone(),
                    session_name,
                    cwd,
                    session_type,
                    contact_name,
                    display_name,
                    tier,
                    source_backend,
                    model,
                    session_id,
                    participants,
                    created_at,
                    updated_at: now,
                    last_message_time: None,
                },
            );
        }
        self.flush()
    }

    pub fn get(&self, chat_id: &ChatId) -> Option<RegistryEntry> {
        self.entries.read().get(chat_id.as_str()).cloned()
    }

    pub fn get_by_session_name(&self, name: &str) -> Option<RegistryEntry> {
        self.entries
            .read()
            .values()
            .find(|e| e.session_name == name)
            .cloned()
    }

    /// Snapshot of all entries (copy — safe to iterate without holding the
    /// registry lock).
    pub fn all(&self) -> Vec<RegistryEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn remove(&self, chat_id: &ChatId) -> Result<()> {
        let removed = self.entries.write().remove(chat_id.as_str()).is_some();
        if removed {
            self.flush()?;
        }
        Ok(())
    }

    /// Used by the IPC `set_model` command (§4.8): the registry is updated
    /// first so that the subsequent restart's `ensure_session` re-reads the
    /// new model from this entry.
    pub fn update_model(&self, chat_id: &ChatId, model: impl Into<String>) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if let Some(e) = entries.get_mut(chat_id.as_str()) {
                e.model = model.into();
                e.updated_at = Utc::now();
            }
        }
        self.flush()
    }

    pub fn update_session_id(&self, chat_id: &ChatId, session_id: impl Into<String>) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if let Some(e) = entries.get_mut(chat_id.as_str()) {
                e.session_id = Some(session_id.into());
                e.updated_at = Utc::now();
            }
        }
        self.flush()
    }

    /// Debounced: marks the in-memory map dirty immediately but does not
    /// itself write to disk. A background task should call
    /// [`Self::flush_if_dirty`] on an interval (≤1s) to collapse bursts of
    /// these calls into a single write (§4.1).
    pub fn update_last_message_time(&self, chat_id: &ChatId) {
        let mut entries = self.entries.write();
        if let Some(e) = entries.get_mut(chat_id.as_str()) {
            let now = Utc::now();
            e.last_message_time = Some(now);
            e.updated_at = now;
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Flush only if [`Self::update_last_message_time`] has marked the
    /// registry dirty since the last flush.
    pub fn flush_if_dirty(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.flush()?;
        }
        Ok(())
    }

    /// Force a write of the in-memory map to disk, regardless of the dirty
    /// flag. Always called on graceful shutdown.
    pub fn flush(&self) -> Result<()> {
        let snapshot = self.entries.read().clone();
        match self.write_atomic(&snapshot) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                TraceEvent::RegistryFlushed {
                    entries: snapshot.len(),
                }
                .emit();
                Ok(())
            }
            Err(e) => {
                // In-memory change is retained regardless; the next
                // successful flush picks it up (§4.1 "Failure semantics").
                TraceEvent::RegistryWriteFailed {
                    error: e.to_string(),
                }
                .emit();
                tracing::warn!(error = %e, "registry flush failed, in-memory state retained");
                Err(e)
            }
        }
    }

    fn write_atomic(&self, snapshot: &HashMap<String, RegistryEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(Error::Io)?;
        tmp.lock_exclusive().map_err(Error::Io)?;
        tmp.write_all(json.as_bytes()).map_err(Error::Io)?;
        tmp.flush().map_err(Error::Io)?;
        FileExt::unlock(&tmp).ok();
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(chat_id: &ChatId) -> (String, PathBuf, SessionType, String, Option<String>, Tier, String, String, Option<String>, Vec<String>) {
        (
            derive_session_name("imessage", chat_id),
            PathBuf::from("/tmp/session-cwd"),
            SessionType::Individual,
            "Dave".into(),
            None,
            Tier::Admin,
            "imessage".into(),
            "opus".into(),
            None,
            vec![],
        )
    }

    #[test]
    fn register_then_get_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::load(dir.path().join("registry.json"));
        let chat_id = ChatId::new("", "+15555551234");
        let (name, cwd, st, cname, dname, tier, src, model, sid, parts) = entry(&chat_id);

        reg.register(
            &chat_id, name.clone(), cwd.clone(), st, cname.clone(), dname.clone(), tier, src.clone(), model.clone(), sid.clone(), parts.clone(),
        )
        .unwrap();
        let first = reg.get(&chat_id).unwrap();

        // Re-register: created_at must not change.
        std::thread::sleep(std::time::Duration::from_millis(5));
        reg.register(&chat_id, name, cwd, st, cname, dname, tier, src, model, sid, parts)
            .unwrap();
        let second = reg.get(&chat_id).unwrap();

        assert_eq!(first.created_at, second.created_at);
    }

    #[test]
    fn flush_then_reload_has_parity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let reg = SessionRegistry::load(&path);

        for i in 0..20 {
            let chat_id = ChatId::new("", &format!("555555{i:04}"));
            let (name, cwd, st, cname, dname, tier, src, model, sid, parts) = entry(&chat_id);
            reg.register(&chat_id, name, cwd, st, cname, dname, tier, src, model, sid, parts)
                .unwrap();
        }

        for i in 0..2000 {
            let chat_id = ChatId::new("", &format!("555555{:04}", i % 20));
            reg.update_last_message_time(&chat_id);
        }
        reg.flush().unwrap();

        let reloaded = SessionRegistry::load(&path);
        assert_eq!(reloaded.all().len(), 20);
        for e in reloaded.all() {
            assert!(e.last_message_time.is_some());
        }
    }

    #[test]
    fn corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"not json").unwrap();
        let reg = SessionRegistry::load(&path);
        assert!(reg.all().is_empty());
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::load(dir.path().join("registry.json"));
        let chat_id = ChatId::new("", "+15555551234");
        let (name, cwd, st, cname, dname, tier, src, model, sid, parts) = entry(&chat_id);
        reg.register(&chat_id, name, cwd, st, cname, dname, tier, src, model, sid, parts)
            .unwrap();
        assert!(reg.get(&chat_id).is_some());
        reg.remove(&chat_id).unwrap();
        assert!(reg.get(&chat_id).is_none());
    }

    #[test]
    fn update_session_id_persists() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SessionRegistry::load(dir.path().join("registry.json"));
        let chat_id = ChatId::new("", "+15555551234");
        let (name, cwd, st, cname, dname, tier, src, model, sid, parts) = entry(&chat_id);
        reg.register(&chat_id, name, cwd, st, cname, dname, tier, src, model, sid, parts)
            .unwrap();
        reg.update_session_id(&chat_id, "resumed-id-123").unwrap();
        assert_eq!(
            reg.get(&chat_id).unwrap().session_id,
            Some("resumed-id-123".to_string())
        );
    }

    #[test]
    fn flush_if_dirty_only_writes_when_marked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let reg = SessionRegistry::load(&path);
        let chat_id = ChatId::new("", "+15555551234");
        let (name, cwd, st, cname, dname, tier, src, model, sid, parts) = entry(&chat_id);
        reg.register(&chat_id, name, cwd, st, cname, dname, tier, src, model, sid, parts)
            .unwrap();

        // register() already flushed (dirty cleared); flush_if_dirty is a no-op.
        assert!(!reg.dirty.load(Ordering::Acquire));
        reg.flush_if_dirty().unwrap();

        reg.update_last_message_time(&chat_id);
        assert!(reg.dirty.load(Ordering::Acquire));
        reg.flush_if_dirty().unwrap();
        assert!(!reg.dirty.load(Ordering::Acquire));
    }

    #[test]
    fn session_name_derivation_is_deterministic() {
        let chat_id = ChatId::new("signal:", "+15555551234");
        assert_eq!(
            derive_session_name("signal", &chat_id),
            "signal/signal_15555551234"
        );
    }
}
