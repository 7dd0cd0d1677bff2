//! Tier-to-capability mapping (§4.3): which tools a session gets, which
//! permission mode it runs under, and the runtime permission callback for
//! the tiers that need one. Grounded in `sdk_session.py`'s
//! `_build_options`/`_permission_check`.

use std::path::PathBuf;

use sa_domain::config::TierPolicyConfig;
use sa_domain::tier::Tier;

use crate::adapter::AgentStartOptions;

const FULL_ACCESS_TOOLS: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch", "Task",
    "NotebookEdit", "Skill", "AskUserQuestion",
];
const FAMILY_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch", "Task"];
const FAVORITE_TOOLS: &[&str] = &["Read", "WebSearch", "WebFetch", "Grep", "Glob", "Bash"];

/// Allowed tools and permission mode for a tier, independent of turn limits
/// (those come from [`Tier::max_turns`], already defined in `sa-domain`).
pub fn allowed_tools(tier: Tier) -> &'static [&'static str] {
    match tier {
        // Group/master/background sessions are passed `Tier::Admin` by the
        // orchestrator, so they land here too.
        Tier::Admin | Tier::Wife => FULL_ACCESS_TOOLS,
        Tier::Family => FAMILY_TOOLS,
        Tier::Favorite | Tier::Bots | Tier::Unknown => FAVORITE_TOOLS,
    }
}

/// Build the options used to launch or resume an agent subprocess for one
/// session. `resume_session_id` takes the existing conversation id;
/// otherwise a fresh id is minted so the CLI never auto-resumes from its
/// own session index (`sdk_session.py`'s `extra_args={"session-id": ...}`
/// comment).
#[allow(clippy::too_many_arguments)]
pub fn build_start_options(
    tier: Tier,
    cwd: PathBuf,
    model: String,
    fallback_model: String,
    max_buffer_bytes: usize,
    resume_session_id: Option<String>,
    system_prompt: Option<String>,
) -> AgentStartOptions {
    let fresh_session_id = if resume_session_id.is_none() {
        Some(uuid::Uuid::new_v4().to_string())
    } else {
        None
    };
    AgentStartOptions {
        cwd,
        allowed_tools: allowed_tools(tier).to_vec(),
        bypass_permissions: tier.bypasses_permissions(),
        model,
        fallback_model: Some(fallback_model),
        max_turns: tier.max_turns(),
        max_buffer_bytes,
        resume_session_id,
        fresh_session_id,
        system_prompt,
    }
}

/// Outcome of a permission check against one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny { message: String },
}

/// Runtime permission callback for `favorite`/`family` tiers (§4.3). Only
/// called when [`Tier::needs_permission_callback`] is true for the session's
/// tier; other tiers either bypass entirely or have no callback configured.
pub fn check_tool_permission(
    tier: Tier,
    tool_name: &str,
    tool_input: &serde_json::Value,
    policy: &TierPolicyConfig,
) -> PermissionDecision {
    if !tier.needs_permission_callback() {
        return PermissionDecision::Allow;
    }

    if matches!(tool_name, "Write" | "Edit" | "NotebookEdit") {
        return PermissionDecision::Deny {
            message: format!("{tool_name} blocked for {tier} tier"),
        };
    }

    if tool_name == "Bash" {
        let cmd = tool_input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if !cmd.starts_with(policy.whitelisted_bash_program.as_str()) {
            return PermissionDecision::Deny {
                message: format!("only {} allowed for {tier} tier", policy.whitelisted_bash_program),
            };
        }
    }

    if tool_name == "Read" {
        let path = tool_input
            .get("file_path")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if policy
            .sensitive_path_substrings
            .iter()
            .any(|s| path.contains(s.as_str()))
        {
            return PermissionDecision::Deny {
                message: format!("sensitive file blocked for {tier} tier"),
            };
        }
    }

    PermissionDecision::Allow
}
