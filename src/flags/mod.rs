//! # Feature Flags
//!
//! Three layers decide which protections and features are active:
//!
//! - **Static** ([`StaticFlags`]): boolean capabilities computed once at
//!   startup from configuration; frozen for the process lifetime.
//! - **Dynamic** ([`DynamicFlags`]): named scalar values mutable at runtime,
//!   read through a short-TTL local cache over the KV store.
//! - **Per-user** ([`UserFlags`]): deterministic rollout and variant
//!   assignment from a stable hash of the user id.
//!
//! Defaults lean restrictive: nothing fetches, verifies, or delivers unless
//! configuration switches it on.

use serde::{Deserialize, Serialize};

pub mod dynamic;
pub mod user;

pub use dynamic::DynamicFlags;
pub use user::{stable_hash, FlagDefinition, UserFlagContext, UserFlags};

use crate::config::CoreConfig;

/// Scalar value a flag can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    /// Boolean gate.
    Bool(bool),
    /// Numeric knob.
    Number(f64),
    /// String selector.
    Str(String),
}

impl FlagValue {
    /// Boolean reading; non-boolean values use JS-style truthiness.
    pub fn as_bool(&self) -> bool {
        match self {
            FlagValue::Bool(b) => *b,
            FlagValue::Number(n) => *n != 0.0,
            FlagValue::Str(s) => !s.is_empty(),
        }
    }

    /// Numeric reading, when the value is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String reading, when the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Boolean capabilities fixed at startup.
///
/// Constructed once from [`CoreConfig`] and handed out by shared reference;
/// there is no way to mutate an instance after construction.
#[derive(Debug, Clone)]
pub struct StaticFlags {
    web_fetch_enabled: bool,
    verification_enabled: bool,
    webhooks_enabled: bool,
    reminders_enabled: bool,
    allow_private_ips: bool,
    allow_localhost: bool,
    validate_certs: bool,
}

impl StaticFlags {
    /// Derive the static capability set from configuration.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            web_fetch_enabled: config.fetch.enabled,
            verification_enabled: config.verification.enabled,
            webhooks_enabled: config.webhooks.enabled,
            reminders_enabled: config.reminders.enabled,
            allow_private_ips: config.fetch.allow_private_ips,
            allow_localhost: config.fetch.allow_localhost,
            validate_certs: config.fetch.validate_certs,
        }
    }

    /// Whether server-side URL fetching is available at all.
    pub fn web_fetch_enabled(&self) -> bool {
        self.web_fetch_enabled
    }

    /// Whether claim verification is available.
    pub fn verification_enabled(&self) -> bool {
        self.verification_enabled
    }

    /// Whether webhook delivery is available.
    pub fn webhooks_enabled(&self) -> bool {
        self.webhooks_enabled
    }

    /// Whether the reminder scheduler runs.
    pub fn reminders_enabled(&self) -> bool {
        self.reminders_enabled
    }

    /// Whether fetches may target private address space.
    pub fn allow_private_ips(&self) -> bool {
        self.allow_private_ips
    }

    /// Whether fetches may target loopback addresses.
    pub fn allow_localhost(&self) -> bool {
        self.allow_localhost
    }

    /// Whether TLS certificate validation is enforced.
    pub fn validate_certs(&self) -> bool {
        self.validate_certs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_lean_restrictive() {
        let flags = StaticFlags::from_config(&CoreConfig::default());
        assert!(!flags.web_fetch_enabled());
        assert!(!flags.verification_enabled());
        assert!(!flags.allow_private_ips());
        assert!(!flags.allow_localhost());
        assert!(flags.validate_certs());
    }

    #[test]
    fn flag_value_readings() {
        assert!(FlagValue::Bool(true).as_bool());
        assert!(!FlagValue::Str(String::new()).as_bool());
        assert_eq!(FlagValue::Number(2.5).as_number(), Some(2.5));
        assert_eq!(FlagValue::Str("blue".into()).as_str(), Some("blue"));
    }

    #[test]
    fn flag_value_json_shapes() {
        let parsed: FlagValue = serde_json::from_str("true").unwrap();
        assert_eq!(parsed, FlagValue::Bool(true));
        let parsed: FlagValue = serde_json::from_str("42.0").unwrap();
        assert_eq!(parsed, FlagValue::Number(42.0));
        let parsed: FlagValue = serde_json::from_str("\"beta\"").unwrap();
        assert_eq!(parsed, FlagValue::Str("beta".into()));
    }
}
