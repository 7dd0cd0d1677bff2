//! Layered YAML configuration for the session orchestrator daemon.
//!
//! Loaded from `config.local.yaml` (teacher precedent: the original
//! `assistant/config.py` `LOCAL_CONFIG_FILE` convention), merged with
//! `#[serde(default)]` struct defaults, and validated via
//! [`Config::validate`] before the daemon does anything else.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub owner: OwnerConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub idle_reaper: IdleReaperConfig,
    #[serde(default)]
    pub tier_policy: TierPolicyConfig,
    #[serde(default)]
    pub session: SessionDefaultsConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub cancellation: CancellationConfig,
}

/// Identity of the daemon's owner — the admin-tier contact. Both fields are
/// required: "Missing required keys abort startup" (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OwnerConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SignalConfig {
    pub account: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Filesystem layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root containing `registry.json` and the IPC socket, if relative to
    /// a well-known location rather than `/tmp`.
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    /// Root of `<transcripts_root>/<session_name>/` directories.
    #[serde(default = "d_transcripts_root")]
    pub transcripts_root: PathBuf,
    /// Root of `<logs_root>/sessions/<session_log_name>.log` files.
    #[serde(default = "d_logs_root")]
    pub logs_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
            transcripts_root: d_transcripts_root(),
            logs_root: d_logs_root(),
        }
    }
}

impl PathsConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.json")
    }
}

fn d_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dispatch/state")
}
fn d_transcripts_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dispatch/transcripts")
}
fn d_logs_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dispatch/logs")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "d_tier1_interval")]
    pub tier1_interval_secs: u64,
    #[serde(default = "d_tier2_interval")]
    pub tier2_interval_secs: u64,
    #[serde(default = "d_recently_healed_ttl")]
    pub recently_healed_ttl_secs: u64,
    #[serde(default = "d_staleness_window")]
    pub staleness_window_secs: u64,
    #[serde(default = "d_tier2_lookback")]
    pub tier2_lookback_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tier1_interval_secs: d_tier1_interval(),
            tier2_interval_secs: d_tier2_interval(),
            recently_healed_ttl_secs: d_recently_healed_ttl(),
            staleness_window_secs: d_staleness_window(),
            tier2_lookback_secs: d_tier2_lookback(),
        }
    }
}

fn d_tier1_interval() -> u64 {
    60
}
fn d_tier2_interval() -> u64 {
    300
}
fn d_recently_healed_ttl() -> u64 {
    300
}
fn d_staleness_window() -> u64 {
    600
}
fn d_tier2_lookback() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idle reaper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleReaperConfig {
    #[serde(default = "d_idle_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "d_idle_threshold")]
    pub threshold_secs: i64,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: d_idle_scan_interval(),
            threshold_secs: d_idle_threshold(),
        }
    }
}

fn d_idle_scan_interval() -> u64 {
    300
}
fn d_idle_threshold() -> i64 {
    2 * 60 * 60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tier policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime-configurable pieces of the permission callback (§4.3), not
/// hardcoded: the whitelisted Bash program and the sensitive-path
/// substrings are `Vec<String>`/`String`, validated at startup, matching
/// the teacher's `ExecSecurityConfig.denied_patterns` convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicyConfig {
    #[serde(default = "d_whitelisted_bash_program")]
    pub whitelisted_bash_program: String,
    #[serde(default = "d_sensitive_path_substrings")]
    pub sensitive_path_substrings: Vec<String>,
    #[serde(default = "d_max_image_dimension")]
    pub max_image_dimension_px: u32,
}

impl Default for TierPolicyConfig {
    fn default() -> Self {
        Self {
            whitelisted_bash_program: d_whitelisted_bash_program(),
            sensitive_path_substrings: d_sensitive_path_substrings(),
            max_image_dimension_px: d_max_image_dimension(),
        }
    }
}

fn d_whitelisted_bash_program() -> String {
    "osascript".into()
}
fn d_sensitive_path_substrings() -> Vec<String> {
    vec![
        ".ssh".into(),
        ".env".into(),
        "credentials".into(),
        "secrets".into(),
    ]
}
fn d_max_image_dimension() -> u32 {
    2000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDefaultsConfig {
    #[serde(default = "d_default_model")]
    pub default_model: String,
    #[serde(default = "d_fallback_model")]
    pub fallback_model: String,
    #[serde(default = "d_max_buffer_bytes")]
    pub max_buffer_size_bytes: u64,
    #[serde(default = "d_send_queue_timeout")]
    pub send_queue_timeout_secs: u64,
    #[serde(default = "d_max_consecutive_send_failures")]
    pub max_consecutive_send_failures: u32,
}

impl Default for SessionDefaultsConfig {
    fn default() -> Self {
        Self {
            default_model: d_default_model(),
            fallback_model: d_fallback_model(),
            max_buffer_size_bytes: d_max_buffer_bytes(),
            send_queue_timeout_secs: d_send_queue_timeout(),
            max_consecutive_send_failures: d_max_consecutive_send_failures(),
        }
    }
}

fn d_default_model() -> String {
    "opus".into()
}
fn d_fallback_model() -> String {
    "sonnet".into()
}
fn d_max_buffer_bytes() -> u64 {
    10 * 1024 * 1024
}
fn d_send_queue_timeout() -> u64 {
    30
}
fn d_max_consecutive_send_failures() -> u32 {
    3
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// IPC server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "d_ipc_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: d_ipc_socket_path(),
        }
    }
}

fn d_ipc_socket_path() -> PathBuf {
    PathBuf::from("/tmp/claude-assistant.sock")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vision / shutdown / cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "d_vision_timeout")]
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: d_vision_timeout(),
        }
    }
}

fn d_vision_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "d_summarize_timeout")]
    pub summarize_timeout_secs: u64,
    #[serde(default = "d_terminate_grace")]
    pub terminate_grace_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            summarize_timeout_secs: d_summarize_timeout(),
            terminate_grace_secs: d_terminate_grace(),
        }
    }
}

fn d_summarize_timeout() -> u64 {
    60
}
fn d_terminate_grace() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationConfig {
    #[serde(default = "d_spurious_cancel_ceiling")]
    pub spurious_cancel_ceiling: u32,
}

impl Default for CancellationConfig {
    fn default() -> Self {
        Self {
            spurious_cancel_ceiling: d_spurious_cancel_ceiling(),
        }
    }
}

fn d_spurious_cancel_ceiling() -> u32 {
    500
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration, returning issues by severity. Any
    /// `Error`-severity issue must abort startup (§6: "Missing required
    /// keys abort startup").
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.owner.name.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "owner.name".into(),
                message: "owner.name is required".into(),
            });
        }
        if self.owner.phone.trim().is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "owner.phone".into(),
                message: "owner.phone is required".into(),
            });
        }

        if self.signal.account.is_none() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "signal.account".into(),
                message: "no signal.account configured — the signal backend will be unusable"
                    .into(),
            });
        }

        for (field, pattern) in [(
            "tier_policy.whitelisted_bash_program",
            &self.tier_policy.whitelisted_bash_program,
        )] {
            if pattern.trim().is_empty() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: field.into(),
                    message: "must not be empty".into(),
                });
            }
        }

        if self.tier_policy.sensitive_path_substrings.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "tier_policy.sensitive_path_substrings".into(),
                message: "empty — favorite/family tiers will have no path-based read denial"
                    .into(),
            });
        }

        if self.health.tier1_interval_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "health.tier1_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.health.tier2_interval_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "health.tier2_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.idle_reaper.threshold_secs <= 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "idle_reaper.threshold_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.session.max_consecutive_send_failures == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "session.max_consecutive_send_failures".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}
