//! Admin-only inbound intercepts, checked before normal tier routing
//! (§4.4 "Intercepts"): `HEALME`, `MASTER`, `RESTART`.

use sa_domain::trace::TraceEvent;

/// Parsed admin intercept, or `None` if the text is an ordinary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercept {
    /// `HEALME [context]` — spawn an ephemeral diagnostic session.
    HealMe { context: Option<String> },
    /// `MASTER <prompt>` — route to the persistent admin super-session.
    Master { prompt: String },
    /// `RESTART` — restart the session owning the inbound chat_id.
    Restart,
}

/// Parse `text` as an intercept command. Case-sensitive on the leading
/// keyword, matching the corpus convention of all-caps control keywords.
pub fn parse(text: &str) -> Option<Intercept> {
    let trimmed = text.trim();

    if let Some(rest) = trimmed.strip_prefix("HEALME") {
        let context = rest.trim();
        return Some(Intercept::HealMe {
            context: if context.is_empty() {
                None
            } else {
                Some(context.to_string())
            },
        });
    }
    if let Some(rest) = trimmed.strip_prefix("MASTER") {
        return Some(Intercept::Master {
            prompt: rest.trim().to_string(),
        });
    }
    if trimmed == "RESTART" {
        return Some(Intercept::Restart);
    }
    None
}

pub fn log_triggered(kind: &str, chat_id: &str) {
    TraceEvent::InterceptTriggered {
        kind: kind.to_string(),
        chat_id: chat_id.to_string(),
    }
    .emit();
}
