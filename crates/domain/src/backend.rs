//! Messaging backend registry.
//!
//! A [`Backend`] is a value-type record describing one transport the
//! orchestrator can receive/send over. The set is fixed at build time; there
//! is no plugin mechanism for registering new backends at runtime.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Static description of a messaging transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Internal identifier, e.g. `"signal"`.
    pub name: &'static str,
    /// Short label used in transcripts and log lines, e.g. `"SIGNAL"`.
    pub label: &'static str,
    /// Appended to the bare chat id to form the on-disk session name.
    /// Empty for the default backend.
    pub session_suffix: &'static str,
    /// Prepended to the bare chat id to form the canonical [`crate::ChatId`].
    /// Empty for the default backend.
    pub registry_prefix: &'static str,
    /// Shell command template used to send a direct reply, `{0}` = recipient,
    /// `{1}` = message body. `None` when sending is not supported.
    pub send_cmd: Option<&'static str>,
    /// Shell command template used to send a group reply.
    pub send_group_cmd: Option<&'static str>,
    /// Shell command template used to fetch recent history for reply-chain
    /// resolution. `None` when the backend has no history source.
    pub history_cmd: Option<&'static str>,
}

fn registry() -> &'static HashMap<&'static str, Backend> {
    static REGISTRY: OnceLock<HashMap<&'static str, Backend>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert(
            "imessage",
            Backend {
                name: "imessage",
                label: "SMS",
                session_suffix: "",
                registry_prefix: "",
                send_cmd: Some("imessage-send {0} {1}"),
                send_group_cmd: Some("imessage-send-group {0} {1}"),
                history_cmd: Some("imessage-history {0}"),
            },
        );
        m.insert(
            "signal",
            Backend {
                name: "signal",
                label: "SIGNAL",
                session_suffix: "-signal",
                registry_prefix: "signal:",
                send_cmd: Some("signal-cli send {0} {1}"),
                send_group_cmd: Some("signal-cli send -g {0} {1}"),
                history_cmd: Some("signal-cli history {0}"),
            },
        );
        m.insert(
            "test",
            Backend {
                name: "test",
                label: "TEST",
                session_suffix: "-test",
                registry_prefix: "test:",
                send_cmd: None,
                send_group_cmd: None,
                history_cmd: None,
            },
        );
        m.insert(
            "voice-app",
            Backend {
                name: "voice-app",
                label: "VOICE_APP",
                session_suffix: "-voice",
                registry_prefix: "voice:",
                send_cmd: Some("voice-app-send {0} {1}"),
                send_group_cmd: None,
                history_cmd: None,
            },
        );
        m
    })
}

/// Look up a backend by name, falling back to `imessage` (the default
/// backend) when `source` is unrecognized.
pub fn get_backend(source: &str) -> &'static Backend {
    registry()
        .get(source)
        .unwrap_or_else(|| registry().get("imessage").expect("imessage always registered"))
}

/// All known backend names, for config validation and CLI help text.
pub fn backend_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_source_falls_back_to_imessage() {
        let b = get_backend("carrier-pigeon");
        assert_eq!(b.name, "imessage");
    }

    #[test]
    fn signal_has_group_send_and_prefix() {
        let b = get_backend("signal");
        assert_eq!(b.registry_prefix, "signal:");
        assert!(b.send_group_cmd.is_some());
    }

    #[test]
    fn voice_app_has_no_group_send() {
        let b = get_backend("voice-app");
        assert_eq!(b.registry_prefix, "voice:");
        assert_eq!(b.session_suffix, "-voice");
        assert!(b.send_group_cmd.is_none());
        assert!(b.history_cmd.is_none());
    }

    #[test]
    fn four_backends_registered() {
        assert_eq!(backend_names(), vec!["imessage", "signal", "test", "voice-app"]);
    }
}
