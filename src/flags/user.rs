//! Per-user flag evaluation.
//!
//! A pure function of the user's context and compiled-in definitions, so two
//! processes always agree on a user's assignment. Evaluation order per flag:
//! tier allowlist → account-age gate → rollout percentile → default value.
//! Variant flags pick `variants[stable_hash(user) % len]`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::FlagValue;

/// Deterministic 32-bit fold of a UTF-8 string (DJB2).
///
/// The bucket assignment derived from this value must never change across
/// processes or restarts; do not swap the function without migrating every
/// stored rollout.
pub fn stable_hash(input: &str) -> u32 {
    let mut hash: u32 = 5381;
    for byte in input.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    hash
}

/// Compiled-in definition of one per-user flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    /// Value when no gate matches.
    pub default_value: FlagValue,

    /// Percentage of users (0–100) the flag is rolled out to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<u8>,

    /// Tiers for which the flag is always on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_tiers: Option<Vec<String>>,

    /// Accounts created at or after this instant get the flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_after: Option<DateTime<Utc>>,

    /// Variant pool for multivariate flags; selection is by stable hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<Vec<FlagValue>>,
}

/// The user-shaped inputs evaluation depends on.
#[derive(Debug, Default, Clone)]
pub struct UserFlagContext {
    /// Subject id; absent for anonymous traffic.
    pub user_id: Option<String>,

    /// Subscription tier, when known.
    pub user_tier: Option<String>,

    /// Account creation time, when known.
    pub user_created_at: Option<DateTime<Utc>>,

    /// Test hook: forces the rollout percentile instead of hashing.
    pub percentile_override: Option<u8>,
}

/// Evaluator over a set of compiled-in definitions.
#[derive(Debug, Clone, Default)]
pub struct UserFlags {
    definitions: HashMap<String, FlagDefinition>,
}

impl UserFlags {
    /// Build an evaluator from definitions.
    pub fn new(definitions: HashMap<String, FlagDefinition>) -> Self {
        Self { definitions }
    }

    /// The definition registered under `name`, if any.
    pub fn definition(&self, name: &str) -> Option<&FlagDefinition> {
        self.definitions.get(name)
    }

    /// Evaluate a flag for a user. `None` when the flag is undefined.
    pub fn evaluate(&self, name: &str, ctx: &UserFlagContext) -> Option<FlagValue> {
        let def = self.definitions.get(name)?;

        if self.gate_matches(def, ctx) {
            return Some(self.enabled_value(def, ctx));
        }
        Some(def.default_value.clone())
    }

    /// Boolean convenience; undefined flags read as disabled.
    pub fn is_enabled(&self, name: &str, ctx: &UserFlagContext) -> bool {
        self.evaluate(name, ctx).map(|v| v.as_bool()).unwrap_or(false)
    }

    fn gate_matches(&self, def: &FlagDefinition, ctx: &UserFlagContext) -> bool {
        if let (Some(tiers), Some(tier)) = (&def.enabled_tiers, &ctx.user_tier) {
            if tiers.iter().any(|t| t.eq_ignore_ascii_case(tier)) {
                return true;
            }
        }

        if let (Some(after), Some(created)) = (def.enabled_after, ctx.user_created_at) {
            if created >= after {
                return true;
            }
        }

        if let Some(rollout) = def.rollout_percentage {
            if let Some(bucket) = self.bucket(ctx) {
                if bucket < rollout.min(100) {
                    return true;
                }
            }
        }

        false
    }

    /// The user's percentile bucket in [0, 100).
    fn bucket(&self, ctx: &UserFlagContext) -> Option<u8> {
        if let Some(forced) = ctx.percentile_override {
            return Some(forced.min(99));
        }
        ctx.user_id
            .as_deref()
            .map(|id| (stable_hash(id) % 100) as u8)
    }

    /// Value handed to a user who passed a gate: the hashed variant for
    /// multivariate flags, plain `true` otherwise.
    fn enabled_value(&self, def: &FlagDefinition, ctx: &UserFlagContext) -> FlagValue {
        if let (Some(variants), Some(user_id)) = (&def.variants, ctx.user_id.as_deref()) {
            if !variants.is_empty() {
                let index = (stable_hash(user_id) as usize) % variants.len();
                return variants[index].clone();
            }
        }
        FlagValue::Bool(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn user(id: &str) -> UserFlagContext {
        UserFlagContext {
            user_id: Some(id.to_string()),
            ..UserFlagContext::default()
        }
    }

    fn flags_with(name: &str, def: FlagDefinition) -> UserFlags {
        let mut defs = HashMap::new();
        defs.insert(name.to_string(), def);
        UserFlags::new(defs)
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("user-42"), stable_hash("user-42"));
        assert_ne!(stable_hash("user-42"), stable_hash("user-43"));
        // Pinned value guards against accidental function swaps.
        assert_eq!(stable_hash(""), 5381);
    }

    #[test]
    fn undefined_flag_reads_disabled() {
        let flags = UserFlags::default();
        assert!(!flags.is_enabled("missing", &user("u1")));
        assert_eq!(flags.evaluate("missing", &user("u1")), None);
    }

    #[test]
    fn tier_allowlist_wins_before_rollout() {
        let flags = flags_with(
            "beta_tools",
            FlagDefinition {
                default_value: FlagValue::Bool(false),
                rollout_percentage: Some(0),
                enabled_tiers: Some(vec!["premium".to_string()]),
                enabled_after: None,
                variants: None,
            },
        );
        let mut ctx = user("u1");
        ctx.user_tier = Some("Premium".to_string());
        assert!(flags.is_enabled("beta_tools", &ctx));

        ctx.user_tier = Some("free".to_string());
        assert!(!flags.is_enabled("beta_tools", &ctx));
    }

    #[test]
    fn account_age_gate() {
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let flags = flags_with(
            "new_onboarding",
            FlagDefinition {
                default_value: FlagValue::Bool(false),
                rollout_percentage: None,
                enabled_tiers: None,
                enabled_after: Some(cutoff),
                variants: None,
            },
        );
        let mut ctx = user("u1");
        ctx.user_created_at = Some(cutoff + chrono::Duration::days(2));
        assert!(flags.is_enabled("new_onboarding", &ctx));

        ctx.user_created_at = Some(cutoff - chrono::Duration::days(2));
        assert!(!flags.is_enabled("new_onboarding", &ctx));
    }

    #[test]
    fn percentile_override_drives_rollout() {
        let flags = flags_with(
            "gradual",
            FlagDefinition {
                default_value: FlagValue::Bool(false),
                rollout_percentage: Some(25),
                enabled_tiers: None,
                enabled_after: None,
                variants: None,
            },
        );
        let mut ctx = user("u1");
        ctx.percentile_override = Some(10);
        assert!(flags.is_enabled("gradual", &ctx));
        ctx.percentile_override = Some(25);
        assert!(!flags.is_enabled("gradual", &ctx));
    }

    #[test]
    fn variants_are_stable_per_user() {
        let variants = vec![
            FlagValue::Str("compact".into()),
            FlagValue::Str("cozy".into()),
            FlagValue::Str("roomy".into()),
        ];
        let flags = flags_with(
            "layout",
            FlagDefinition {
                default_value: FlagValue::Str("compact".into()),
                rollout_percentage: Some(100),
                enabled_tiers: None,
                enabled_after: None,
                variants: Some(variants.clone()),
            },
        );

        let first = flags.evaluate("layout", &user("user-7")).unwrap();
        for _ in 0..10 {
            assert_eq!(flags.evaluate("layout", &user("user-7")).unwrap(), first);
        }
        let expected = &variants[(stable_hash("user-7") as usize) % variants.len()];
        assert_eq!(&first, expected);
    }

    #[test]
    fn anonymous_users_never_enter_rollout() {
        let flags = flags_with(
            "gradual",
            FlagDefinition {
                default_value: FlagValue::Bool(false),
                rollout_percentage: Some(100),
                enabled_tiers: None,
                enabled_after: None,
                variants: None,
            },
        );
        assert!(!flags.is_enabled("gradual", &UserFlagContext::default()));
    }

    proptest! {
        #[test]
        fn buckets_are_always_in_range(id in "[a-zA-Z0-9_-]{1,32}") {
            let bucket = stable_hash(&id) % 100;
            prop_assert!(bucket < 100);
        }
    }
}
