use serde::Serialize;

/// Structured trace events emitted across the orchestrator crates.
///
/// Every component in the session lifecycle emits one of these at its key
/// state transitions instead of free-text logging, so the event stream can
/// be grepped or fed to a dashboard without parsing log prose.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated {
        chat_id: String,
        session_name: String,
        tier: String,
        resumed: bool,
    },
    SessionRestarted {
        chat_id: String,
        reason: String,
    },
    SessionKilled {
        chat_id: String,
    },
    TierMismatchRestart {
        chat_id: String,
        old_tier: String,
        new_tier: String,
    },
    ZombieCleaned {
        chat_id: String,
    },
    GroupMessageDropped {
        chat_id: String,
        reason: String,
    },
    HealthTier1Fatal {
        chat_id: String,
        pattern: String,
    },
    HealthTier2Fatal {
        chat_id: String,
        reason: String,
    },
    RecentlyHealedSkip {
        chat_id: String,
        tier: u8,
    },
    IdleReaped {
        chat_id: String,
        idle_secs: i64,
    },
    RegistryFlushed {
        entries: usize,
    },
    RegistryWriteFailed {
        error: String,
    },
    ResultTokenProcessed {
        chat_id: String,
        pending_queries_count: u32,
        is_error: bool,
    },
    ToolExecutionTimed {
        chat_id: String,
        tool: String,
        duration_ms: f64,
        is_error: bool,
        input: serde_json::Value,
    },
    PendingToolStale {
        chat_id: String,
        tool_use_id: String,
    },
    SpuriousCancellation {
        count: u32,
    },
    InterceptTriggered {
        kind: String,
        chat_id: String,
    },
    VisionEnrichmentFailed {
        chat_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "orchestrator_event");
    }
}
