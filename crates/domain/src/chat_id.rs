//! Canonical, normalized conversation identifiers.
//!
//! A [`ChatId`] is a backend prefix (empty for the default backend) plus a
//! bare identifier: an E.164 phone number, or a group identifier (lowercase
//! hex for iMessage groups, base64 for Signal groups). Normalization is
//! total — every valid input string maps to exactly one canonical form.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

fn hex_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-f]{20,}$").unwrap())
}

fn base64_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]{20,}={0,2}$").unwrap())
}

/// Canonical conversation key: `[backend_prefix]bare_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId {
    canonical: String,
}

impl ChatId {
    /// Normalize a raw identifier behind an optional backend prefix
    /// (`""` for the default backend). Normalization is idempotent: calling
    /// `ChatId::new` on an already-canonical `ChatId::as_str()` output
    /// yields the same value.
    pub fn new(backend_prefix: &str, raw: &str) -> Self {
        let bare = normalize_bare(raw);
        Self {
            canonical: format!("{backend_prefix}{bare}"),
        }
    }

    /// Wrap an already-canonical string without renormalizing. Used when
    /// reading back values that were produced by `new`/`as_str` (e.g. from
    /// the registry file or IPC requests), matching the round-trip
    /// invariant that re-normalizing a canonical id is the identity.
    pub fn from_canonical(canonical: impl Into<String>) -> Self {
        Self {
            canonical: canonical.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// True iff the bare identifier (prefix stripped) matches the group
    /// patterns: lowercase hex ≥20 chars, or base64 ≥20 chars.
    pub fn is_group(&self) -> bool {
        let bare = self.bare_part();
        hex_group_re().is_match(bare) || base64_group_re().is_match(bare)
    }

    /// The bare identifier with any known backend prefix stripped. Since
    /// prefixes are opaque to this type (they're assigned by `Backend`
    /// records), this strips the longest run of non-digit, non-`+`
    /// characters up to the first digit/`+`/hex-looking run when a colon
    /// separator is present, else returns the whole string.
    fn bare_part(&self) -> &str {
        match self.canonical.find(':') {
            Some(idx) => &self.canonical[idx + 1..],
            None => &self.canonical,
        }
    }

    /// Sanitized form safe for use as a filesystem path component
    /// (`session_name` derivation per the registry spec): `+`, `:` and
    /// other path-unsafe characters replaced with `_`.
    pub fn sanitized(&self) -> String {
        self.canonical
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Normalize a bare (prefix-stripped) identifier.
///
/// - 10 ASCII digits → `+1XXXXXXXXXX`.
/// - 11 ASCII digits starting with `1` → `+1` followed by the remaining 10.
/// - Already E.164 (`+` followed by digits) → unchanged.
/// - Hex string of length ≥20 → lowercased.
/// - Anything else (base64 group ids, already-normalized values) →
///   unchanged.
fn normalize_bare(raw: &str) -> String {
    let digits_only = raw.chars().all(|c| c.is_ascii_digit());

    if digits_only && raw.len() == 10 {
        return format!("+1{raw}");
    }
    if digits_only && raw.len() == 11 && raw.starts_with('1') {
        return format!("+{raw}");
    }
    if raw.starts_with('+') && raw[1..].chars().all(|c| c.is_ascii_digit()) {
        return raw.to_string();
    }
    if raw.len() >= 20 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return raw.to_ascii_lowercase();
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_digit_normalizes_to_e164() {
        let id = ChatId::new("", "5555551234");
        assert_eq!(id.as_str(), "+15555551234");
    }

    #[test]
    fn eleven_digit_leading_one_normalizes() {
        let id = ChatId::new("", "15555551234");
        assert_eq!(id.as_str(), "+15555551234");
    }

    #[test]
    fn already_e164_is_unchanged() {
        let id = ChatId::new("", "+15555551234");
        assert_eq!(id.as_str(), "+15555551234");
    }

    #[test]
    fn hex_group_is_lowercased() {
        let id = ChatId::new("", "ABCDEF0123456789ABCDEF01");
        assert_eq!(id.as_str(), "abcdef0123456789abcdef01");
        assert!(id.is_group());
    }

    #[test]
    fn backend_prefix_is_preserved() {
        let id = ChatId::new("signal:", "5555551234");
        assert_eq!(id.as_str(), "signal:+15555551234");
    }

    #[test]
    fn phone_number_is_not_a_group() {
        let id = ChatId::new("", "5555551234");
        assert!(!id.is_group());
    }

    #[test]
    fn renormalizing_canonical_is_identity() {
        let id = ChatId::new("", "5555551234");
        let reparsed = ChatId::new("", id.as_str());
        assert_eq!(id, reparsed);

        let group = ChatId::new("", "abcdef0123456789abcdef01");
        let reparsed_group = ChatId::new("", group.as_str());
        assert_eq!(group, reparsed_group);
    }

    #[test]
    fn equality_is_by_canonical_form() {
        let a = ChatId::new("", "5555551234");
        let b = ChatId::new("", "15555551234");
        assert_eq!(a, b);
    }

    #[test]
    fn sanitized_strips_path_unsafe_chars() {
        let id = ChatId::new("signal:", "5555551234");
        assert_eq!(id.sanitized(), "signal_15555551234");
    }

    #[test]
    fn signal_base64_group_id_detected() {
        let id = ChatId::new("signal:", "QWxpY2VCb2JDaGFybGllRGVsdGE=");
        assert!(id.is_group());
    }
}
