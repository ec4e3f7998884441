use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::flag::{FlagKey, FlagRecord};

/// Buckets are assigned in a 100_000-slot space so the threshold math
/// stays integral: a rollout of `p` percent admits buckets `< p * 1000`.
const BUCKET_SPACE: u64 = 100_000;

/// Why an evaluation came out the way it did.
///
/// `NotFound` and `RolloutExcluded` are operationally very different:
/// the former usually means a caller bug or a missing deploy, the latter
/// is the rollout doing its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    NotFound,
    Disabled,
    RolloutExcluded,
    RolloutIncluded,
}

/// Evaluation outcome. `active` is true only for `RolloutIncluded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub active: bool,
    pub reason: Reason,
}

impl Decision {
    pub(crate) fn not_found() -> Self {
        Self {
            active: false,
            reason: Reason::NotFound,
        }
    }
}

/// Caller-supplied evaluation context. The bucketing key is the identity
/// (user, session, device) hashed to assign rollout inclusion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalContext {
    pub bucketing_key: String,
}

impl EvalContext {
    pub fn new(bucketing_key: impl Into<String>) -> Self {
        Self {
            bucketing_key: bucketing_key.into(),
        }
    }
}

/// Stable bucket assignment for a (flag, bucketing key) pair.
///
/// Independent of the rollout value, so a user who is in at 30% stays in
/// at 50%, and identical across processes and restarts.
pub fn bucket(key: &FlagKey, bucketing_key: &str) -> u64 {
    let input = format!("{}.{}.{}", key.name(), key.environment(), bucketing_key);

    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    let hash = hasher.finalize();
    let hex = format!("{:x}", hash);

    let substr = &hex[..15];
    let value = u64::from_str_radix(substr, 16).unwrap_or(0);
    value % BUCKET_SPACE
}

/// Deterministic rollout decision for a flag definition and bucketing key.
///
/// Full and zero rollouts short-circuit without hashing.
pub fn evaluate(record: Option<&FlagRecord>, bucketing_key: &str) -> Decision {
    let Some(record) = record else {
        return Decision::not_found();
    };

    if !record.enabled {
        return Decision {
            active: false,
            reason: Reason::Disabled,
        };
    }

    let percent = record.rollout.percent();
    if percent >= 100 {
        return Decision {
            active: true,
            reason: Reason::RolloutIncluded,
        };
    }
    if percent == 0 {
        return Decision {
            active: false,
            reason: Reason::RolloutExcluded,
        };
    }

    let threshold = u64::from(percent) * 1_000;
    if bucket(&record.key, bucketing_key) < threshold {
        Decision {
            active: true,
            reason: Reason::RolloutIncluded,
        }
    } else {
        Decision {
            active: false,
            reason: Reason::RolloutExcluded,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::flag::Rollout;

    fn record(enabled: bool, percent: u8) -> FlagRecord {
        FlagRecord {
            key: FlagKey::new("checkout_v2", "prod").unwrap(),
            enabled,
            rollout: Rollout::new(percent).unwrap(),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn missing_flag_is_not_found() {
        let decision = evaluate(None, "user-1");
        assert!(!decision.active);
        assert_eq!(decision.reason, Reason::NotFound);
    }

    #[test]
    fn disabled_wins_over_full_rollout() {
        let flag = record(false, 100);
        for i in 0..100 {
            let decision = evaluate(Some(&flag), &format!("user-{i}"));
            assert!(!decision.active);
            assert_eq!(decision.reason, Reason::Disabled);
        }
    }

    #[test]
    fn full_rollout_includes_everyone() {
        let flag = record(true, 100);
        for i in 0..100 {
            let decision = evaluate(Some(&flag), &format!("user-{i}"));
            assert!(decision.active);
            assert_eq!(decision.reason, Reason::RolloutIncluded);
        }
    }

    #[test]
    fn zero_rollout_excludes_everyone() {
        let flag = record(true, 0);
        for i in 0..100 {
            let decision = evaluate(Some(&flag), &format!("user-{i}"));
            assert!(!decision.active);
            assert_eq!(decision.reason, Reason::RolloutExcluded);
        }
    }

    #[test]
    fn decisions_are_deterministic() {
        let flag = record(true, 42);
        let first: Vec<bool> = (0..500)
            .map(|i| evaluate(Some(&flag), &format!("user-{i}")).active)
            .collect();
        for _ in 0..3 {
            let again: Vec<bool> = (0..500)
                .map(|i| evaluate(Some(&flag), &format!("user-{i}")).active)
                .collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn raising_rollout_keeps_existing_inclusions() {
        let at_30 = record(true, 30);
        let at_50 = record(true, 50);
        for i in 0..1000 {
            let user = format!("user-{i}");
            if evaluate(Some(&at_30), &user).active {
                assert!(
                    evaluate(Some(&at_50), &user).active,
                    "{user} was in at 30% but out at 50%"
                );
            }
        }
    }

    #[test]
    fn bucket_ignores_rollout_value() {
        let key = FlagKey::new("checkout_v2", "prod").unwrap();
        assert_eq!(bucket(&key, "user-7"), bucket(&key, "user-7"));
    }

    #[test]
    fn bucket_varies_across_flags_and_environments() {
        let prod = FlagKey::new("checkout_v2", "prod").unwrap();
        let staging = FlagKey::new("checkout_v2", "staging").unwrap();
        // Same user lands in independent buckets per flag/environment;
        // over many users the assignments must not be identical.
        let diverges = (0..100).any(|i| {
            let user = format!("user-{i}");
            bucket(&prod, &user) != bucket(&staging, &user)
        });
        assert!(diverges);
    }

    #[test]
    fn thirty_percent_rollout_lands_near_thirty_percent() {
        let flag = record(true, 30);
        let included = (0..10_000)
            .filter(|i| evaluate(Some(&flag), &format!("user-{i}")).active)
            .count();
        assert!(
            (2_700..=3_300).contains(&included),
            "observed {included} inclusions out of 10000"
        );
    }

    #[test]
    fn empty_bucketing_key_is_stable() {
        let flag = record(true, 50);
        let first = evaluate(Some(&flag), "");
        assert_eq!(first, evaluate(Some(&flag), ""));
    }
}
