//! Whole-object last-writer-wins conflict resolution.
//!
//! Ordering is `(version, timestamp, user_id)`, compared lexicographically.
//! A missing timestamp counts as 0 and a missing user as the empty string,
//! so the order is total and every replica picks the same winner no matter
//! in which order the candidates arrive. An identical stamp never wins,
//! which makes re-delivery a no-op.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// The comparable part of a change: its version plus tie-break fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionStamp {
    pub version: u64,
    pub timestamp_millis: Option<u64>,
    pub user_id: Option<String>,
}

impl VersionStamp {
    pub fn new(version: u64, timestamp_millis: u64, user_id: impl Into<String>) -> Self {
        Self {
            version,
            timestamp_millis: Some(timestamp_millis),
            user_id: Some(user_id.into()),
        }
    }

    pub fn version_only(version: u64) -> Self {
        Self {
            version,
            timestamp_millis: None,
            user_id: None,
        }
    }

    fn timestamp(&self) -> u64 {
        self.timestamp_millis.unwrap_or(0)
    }

    fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or("")
    }

    /// Total order used by the resolver.
    pub fn precedence(&self, other: &VersionStamp) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.timestamp().cmp(&other.timestamp()))
            .then_with(|| self.user().cmp(other.user()))
    }
}

/// Why an incoming change was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyReason {
    FirstWrite,
    HigherVersion,
    LaterTimestamp,
    UserTieBreak,
}

/// Why an incoming change was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    LowerVersion,
    EarlierTimestamp,
    UserTieBreak,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Apply(ApplyReason),
    Stale(StaleReason),
}

impl Resolution {
    pub fn is_apply(&self) -> bool {
        matches!(self, Resolution::Apply(_))
    }
}

/// Pure decision function; holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Decide whether `incoming` should replace `current`.
    pub fn should_apply(current: Option<&VersionStamp>, incoming: &VersionStamp) -> bool {
        Self::decide(current, incoming).is_apply()
    }

    /// Same as [`ConflictResolver::should_apply`], with the deciding rule.
    pub fn decide(current: Option<&VersionStamp>, incoming: &VersionStamp) -> Resolution {
        let current = match current {
            Some(c) => c,
            None => return Resolution::Apply(ApplyReason::FirstWrite),
        };

        match incoming.version.cmp(&current.version) {
            Ordering::Greater => return Resolution::Apply(ApplyReason::HigherVersion),
            Ordering::Less => return Resolution::Stale(StaleReason::LowerVersion),
            Ordering::Equal => {}
        }

        match incoming.timestamp().cmp(&current.timestamp()) {
            Ordering::Greater => return Resolution::Apply(ApplyReason::LaterTimestamp),
            Ordering::Less => return Resolution::Stale(StaleReason::EarlierTimestamp),
            Ordering::Equal => {}
        }

        match incoming.user().cmp(current.user()) {
            Ordering::Greater => Resolution::Apply(ApplyReason::UserTieBreak),
            Ordering::Less => Resolution::Stale(StaleReason::UserTieBreak),
            Ordering::Equal => Resolution::Stale(StaleReason::Duplicate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(version: u64, ts: u64, user: &str) -> VersionStamp {
        VersionStamp::new(version, ts, user)
    }

    #[test]
    fn test_first_write_applies() {
        assert!(ConflictResolver::should_apply(None, &stamp(1, 0, "a")));
        assert_eq!(
            ConflictResolver::decide(None, &VersionStamp::version_only(0)),
            Resolution::Apply(ApplyReason::FirstWrite)
        );
    }

    #[test]
    fn test_higher_version_applies() {
        let current = VersionStamp::version_only(10);
        assert!(ConflictResolver::should_apply(Some(&current), &VersionStamp::version_only(11)));
    }

    #[test]
    fn test_lower_version_rejected() {
        let current = VersionStamp::version_only(11);
        assert!(!ConflictResolver::should_apply(Some(&current), &VersionStamp::version_only(10)));
    }

    #[test]
    fn test_equal_version_later_timestamp_applies() {
        let current = stamp(10, 1000, "x");
        let incoming = stamp(10, 1500, "x");
        assert_eq!(
            ConflictResolver::decide(Some(&current), &incoming),
            Resolution::Apply(ApplyReason::LaterTimestamp)
        );
    }

    #[test]
    fn test_full_tie_lexicographic_user_loses() {
        let current = stamp(10, 1000, "bob");
        let incoming = stamp(10, 1000, "alice");
        assert_eq!(
            ConflictResolver::decide(Some(&current), &incoming),
            Resolution::Stale(StaleReason::UserTieBreak)
        );
    }

    #[test]
    fn test_identical_stamp_is_duplicate() {
        let s = stamp(3, 30, "carol");
        assert_eq!(
            ConflictResolver::decide(Some(&s), &s.clone()),
            Resolution::Stale(StaleReason::Duplicate)
        );
    }

    #[test]
    fn test_apply_twice_then_reject() {
        let incoming = stamp(4, 400, "dave");
        let mut current: Option<VersionStamp> = Some(stamp(2, 100, "erin"));

        assert!(ConflictResolver::should_apply(current.as_ref(), &incoming));
        current = Some(incoming.clone());
        assert!(!ConflictResolver::should_apply(current.as_ref(), &incoming));
    }

    #[test]
    fn test_decision_is_order_independent() {
        let a = stamp(5, 1000, "alice");
        let b = stamp(5, 1000, "bob");

        // Replica 1 sees a then b, replica 2 sees b then a.
        let winner_1 = if ConflictResolver::should_apply(Some(&a), &b) { &b } else { &a };
        let winner_2 = if ConflictResolver::should_apply(Some(&b), &a) { &a } else { &b };
        assert_eq!(winner_1, winner_2);
        assert_eq!(winner_1.user_id.as_deref(), Some("bob"));
    }

    #[test]
    fn test_missing_tie_break_fields_default_low() {
        let current = VersionStamp::version_only(7);
        let incoming = stamp(7, 1, "");
        assert!(ConflictResolver::should_apply(Some(&current), &incoming));
    }

    #[test]
    fn test_precedence_matches_decide() {
        let stamps = [
            stamp(1, 5, "b"),
            stamp(1, 5, "a"),
            stamp(2, 0, "a"),
            stamp(1, 9, "a"),
            VersionStamp::version_only(2),
        ];
        for x in &stamps {
            for y in &stamps {
                let by_order = y.precedence(x) == Ordering::Greater;
                assert_eq!(ConflictResolver::should_apply(Some(x), y), by_order);
            }
        }
    }
}
