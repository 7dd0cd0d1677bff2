//! Trust tier — governs capability set and per-turn cost bound.

use serde::{Deserialize, Serialize};

/// Trust level of a contact. Ordered by capability, descending:
/// `Admin == Wife > Family > Favorite > Bots > Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Admin,
    Wife,
    Family,
    Favorite,
    Bots,
    Unknown,
}

impl Tier {
    /// Rank used for ordering comparisons (lower is more privileged).
    fn rank(self) -> u8 {
        match self {
            Tier::Admin | Tier::Wife => 0,
            Tier::Family => 1,
            Tier::Favorite => 2,
            Tier::Bots => 3,
            Tier::Unknown => 4,
        }
    }

    /// `true` for tiers treated as "blessed" for group admission and
    /// intercept authorization (admin, wife, family, favorite).
    pub fn is_blessed(self) -> bool {
        !matches!(self, Tier::Bots | Tier::Unknown)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Tier::Admin)
    }

    /// Default max_turns bound per injected prompt for this tier.
    pub fn max_turns(self) -> u32 {
        match self {
            Tier::Admin | Tier::Wife => 200,
            Tier::Family => 50,
            Tier::Favorite | Tier::Bots | Tier::Unknown => 30,
        }
    }

    /// `true` when a permission callback must evaluate each tool call for
    /// this tier rather than allow everything unconditionally. Every tier
    /// that does not bypass permissions outright needs one, so that its
    /// `allowed_tools()` set is actually enforced rather than merely
    /// declared — Bots/Unknown get the same restricted Favorite-style
    /// toolset as Favorite (§4.3) and must be checked the same way.
    pub fn needs_permission_callback(self) -> bool {
        !self.bypasses_permissions()
    }

    /// Permission mode: bypass for admin/wife and for group sessions
    /// (group sessions are passed `Tier::Admin` by the orchestrator).
    pub fn bypasses_permissions(self) -> bool {
        matches!(self, Tier::Admin | Tier::Wife)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Admin => "admin",
            Tier::Wife => "wife",
            Tier::Family => "family",
            Tier::Favorite => "favorite",
            Tier::Bots => "bots",
            Tier::Unknown => "unknown",
        }
    }
}

impl PartialOrd for Tier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower rank = higher capability, so reverse for an intuitive
        // "greater tier = more capability" ordering.
        other.rank().cmp(&self.rank())
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Tier::Admin),
            "wife" => Ok(Tier::Wife),
            "family" => Ok(Tier::Family),
            "favorite" => Ok(Tier::Favorite),
            "bots" => Ok(Tier::Bots),
            "unknown" => Ok(Tier::Unknown),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_and_wife_are_equal_rank() {
        assert_eq!(Tier::Admin, Tier::Admin);
        assert!(Tier::Admin.rank() == Tier::Wife.rank());
    }

    #[test]
    fn total_order_descending() {
        assert!(Tier::Admin > Tier::Family);
        assert!(Tier::Family > Tier::Favorite);
        assert!(Tier::Favorite > Tier::Bots);
        assert!(Tier::Bots > Tier::Unknown);
    }

    #[test]
    fn max_turns_per_tier() {
        assert_eq!(Tier::Admin.max_turns(), 200);
        assert_eq!(Tier::Wife.max_turns(), 200);
        assert_eq!(Tier::Family.max_turns(), 50);
        assert_eq!(Tier::Favorite.max_turns(), 30);
        assert_eq!(Tier::Bots.max_turns(), 30);
        assert_eq!(Tier::Unknown.max_turns(), 30);
    }

    #[test]
    fn permission_callback_applies_to_every_non_bypassing_tier() {
        assert!(Tier::Favorite.needs_permission_callback());
        assert!(Tier::Family.needs_permission_callback());
        assert!(Tier::Bots.needs_permission_callback());
        assert!(Tier::Unknown.needs_permission_callback());
        assert!(!Tier::Admin.needs_permission_callback());
        assert!(!Tier::Wife.needs_permission_callback());
    }

    #[test]
    fn blessed_tiers() {
        assert!(Tier::Admin.is_blessed());
        assert!(Tier::Wife.is_blessed());
        assert!(Tier::Family.is_blessed());
        assert!(Tier::Favorite.is_blessed());
        assert!(!Tier::Bots.is_blessed());
        assert!(!Tier::Unknown.is_blessed());
    }

    #[test]
    fn round_trips_through_str() {
        for tier in [
            Tier::Admin,
            Tier::Wife,
            Tier::Family,
            Tier::Favorite,
            Tier::Bots,
            Tier::Unknown,
        ] {
            let parsed: Tier = tier.as_str().parse().unwrap();
            assert_eq!(parsed, tier);
        }
    }
}
