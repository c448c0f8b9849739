//! Plan tiers and the numeric limits they grant.
//!
//! The authoritative tier lives on the user record; this module is the
//! lookup table from tier to participant caps. Anonymous identities are
//! always on the free tier.

use serde::{Deserialize, Serialize};

/// Subscription tier attached to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Pro,
    Team,
}

impl PlanTier {
    /// Parse a stored tier string. Unknown values degrade to `Free`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pro" => Self::Pro,
            "team" => Self::Team,
            _ => Self::Free,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Team => "team",
        }
    }

    /// Maximum simultaneous participants in a room owned by a user on this
    /// tier. Enforced at join time against live occupancy.
    #[must_use]
    pub fn room_participant_limit(self) -> usize {
        match self {
            Self::Free => 2,
            Self::Pro => 10,
            Self::Team => 25,
        }
    }

    /// Maximum participants allowed on a call initiated by a user on this
    /// tier. Distinct from the room join cap.
    #[must_use]
    pub fn call_participant_limit(self) -> usize {
        match self {
            Self::Free => 2,
            Self::Pro => 8,
            Self::Team => 16,
        }
    }
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_tiers() {
        assert_eq!(PlanTier::parse("free"), PlanTier::Free);
        assert_eq!(PlanTier::parse("Pro"), PlanTier::Pro);
        assert_eq!(PlanTier::parse(" TEAM "), PlanTier::Team);
    }

    #[test]
    fn parse_unknown_degrades_to_free() {
        assert_eq!(PlanTier::parse("enterprise"), PlanTier::Free);
        assert_eq!(PlanTier::parse(""), PlanTier::Free);
    }

    #[test]
    fn limits_grow_with_tier() {
        assert!(PlanTier::Free.room_participant_limit() < PlanTier::Pro.room_participant_limit());
        assert!(PlanTier::Pro.room_participant_limit() < PlanTier::Team.room_participant_limit());
        assert!(PlanTier::Free.call_participant_limit() < PlanTier::Pro.call_participant_limit());
    }

    #[test]
    fn round_trips_as_str() {
        for tier in [PlanTier::Free, PlanTier::Pro, PlanTier::Team] {
            assert_eq!(PlanTier::parse(tier.as_str()), tier);
        }
    }
}
