//! # Core Configuration
//!
//! Explicit configuration passed at component construction. There is no
//! module-level mutable state and no lazy singleton: the binary (or a test)
//! builds one [`CoreConfig`] and hands the relevant slice to each component.
//!
//! Values come from the environment via [`CoreConfig::from_env`]; every
//! default leans restrictive: fetching and verification are off, private
//! address space is blocked, certificates are validated.

use std::env;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::logging::LogLevel;

/// Deployment environment; decides log format among other things.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    /// Whether structured JSON output applies.
    pub fn is_structured(&self) -> bool {
        matches!(self, Environment::Staging | Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// How certificate pin mismatches are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Mismatch fails the connection.
    Enforce,
    /// Mismatch is logged and the connection proceeds.
    ReportOnly,
}

/// Logging slice.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum emitted level.
    pub level: LogLevel,
    /// Whether PII redaction is applied.
    pub redact: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            redact: true,
        }
    }
}

/// Outbound fetch and SSRF-guard slice.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Master switch for server-side URL fetching.
    pub enabled: bool,
    /// Permit private-range targets (10/8, 172.16/12, 192.168/16, ULA).
    pub allow_private_ips: bool,
    /// Permit loopback targets.
    pub allow_localhost: bool,
    /// Permit `user:pass@host` URLs.
    pub allow_userinfo: bool,
    /// Deny internationalized hostnames outright.
    pub block_idn: bool,
    /// Deny octal/hex/decimal-encoded IPv4 hostnames.
    pub detect_alternate_encoding: bool,
    /// Deny hostnames embedding a dotted IPv4.
    pub detect_embedded_ip: bool,
    /// Enforce TLS certificate validation.
    pub validate_certs: bool,
    /// TCP connect deadline.
    pub connect_timeout_ms: u64,
    /// Per-read deadline.
    pub read_timeout_ms: u64,
    /// Whole-request deadline.
    pub total_timeout_ms: u64,
    /// Response body cap in bytes.
    pub max_response_bytes: u64,
    /// Follow redirects (each hop re-runs the full guard).
    pub allow_redirects: bool,
    /// Redirect hop budget.
    pub max_redirects: u32,
    /// Ports permitted for outbound connects; `None` disables the check.
    pub allowed_ports: Option<Vec<u16>>,
    /// Hostname suffix patterns denied outright.
    pub blocked_hostnames: Vec<String>,
    /// When non-empty, only these hostname suffixes are permitted.
    pub allowed_hostnames: Vec<String>,
    /// DNS resolution deadline.
    pub dns_timeout_ms: u64,
    /// Ceiling on DNS cache entry lifetime, seconds.
    pub dns_cache_ttl_secs: u64,
    /// Outbound `User-Agent`.
    pub user_agent: String,
    /// SPKI SHA-256 pins, lowercase hex. Empty disables pinning.
    pub certificate_pins: Vec<String>,
    /// Pin mismatch handling.
    pub pin_mode: PinMode,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_private_ips: false,
            allow_localhost: false,
            allow_userinfo: false,
            block_idn: true,
            detect_alternate_encoding: true,
            detect_embedded_ip: true,
            validate_certs: true,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            total_timeout_ms: 30_000,
            max_response_bytes: 1024 * 1024,
            allow_redirects: true,
            max_redirects: 3,
            allowed_ports: Some(vec![80, 443]),
            blocked_hostnames: default_blocked_hostnames(),
            allowed_hostnames: Vec::new(),
            dns_timeout_ms: 2_000,
            dns_cache_ttl_secs: 60,
            user_agent: format!("Nova-Core/{}", env!("CARGO_PKG_VERSION")),
            certificate_pins: Vec::new(),
            pin_mode: PinMode::Enforce,
        }
    }
}

/// Cloud-metadata endpoints and common internal names, matched as
/// case-insensitive suffixes.
fn default_blocked_hostnames() -> Vec<String> {
    [
        "localhost",
        "localhost.localdomain",
        "169.254.169.254",
        "metadata.google.internal",
        "metadata",
        "internal",
        "local",
        "intranet",
        "corp",
        "consul",
        "kubernetes.default.svc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Claim-verification slice.
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// Master switch.
    pub enabled: bool,
    /// Candidate sources fetched per claim.
    pub max_verifications_per_request: usize,
    /// Concurrent fetch ceiling.
    pub max_concurrent_verifications: usize,
    /// Verdict cache lifetime, seconds.
    pub cache_ttl_secs: u64,
    /// Per-request wall-clock budget.
    pub budget_ms: u64,
    /// Domains whose corroboration carries full weight.
    pub trusted_domains: Vec<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_verifications_per_request: 3,
            max_concurrent_verifications: 2,
            cache_ttl_secs: 24 * 60 * 60,
            budget_ms: 15_000,
            trusted_domains: [
                "wikipedia.org",
                "britannica.com",
                "reuters.com",
                "apnews.com",
                "nature.com",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Webhook delivery slice.
#[derive(Debug, Clone)]
pub struct WebhooksConfig {
    /// Master switch.
    pub enabled: bool,
    /// Default retry count beyond the first attempt.
    pub max_retries: u32,
    /// Base retry delay.
    pub retry_delay_ms: u64,
    /// Exponential backoff multiplier.
    pub retry_backoff_multiplier: f64,
    /// Per-attempt delivery deadline.
    pub timeout_ms: u64,
    /// Consecutive failures before a webhook is auto-disabled.
    pub failure_threshold: u32,
    /// Simultaneous in-progress deliveries per webhook.
    pub per_webhook_concurrency: usize,
    /// Terminal deliveries kept per webhook.
    pub archive_cap: usize,
    /// Response body capture cap for diagnostics.
    pub response_capture_bytes: usize,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay_ms: 1_000,
            retry_backoff_multiplier: 2.0,
            timeout_ms: 10_000,
            failure_threshold: 20,
            per_webhook_concurrency: 4,
            archive_cap: 100,
            response_capture_bytes: 4 * 1024,
        }
    }
}

/// Reminder scheduling slice.
#[derive(Debug, Clone)]
pub struct RemindersConfig {
    /// Master switch.
    pub enabled: bool,
    /// Reminders older than this are dropped as stale.
    pub max_age_secs: u64,
    /// Additional grace beyond `max_age_secs`.
    pub grace_secs: u64,
    /// Sends allowed per user per processing batch.
    pub per_user_batch_cap: usize,
}

impl Default for RemindersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_secs: 2 * 60 * 60,
            grace_secs: 5 * 60,
            per_user_batch_cap: 2,
        }
    }
}

/// Root configuration for the trust and transport core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Deployment environment.
    pub environment: Environment,
    /// Logging slice.
    pub log: LogConfig,
    /// Fetch/SSRF slice.
    pub fetch: FetchConfig,
    /// Verification slice.
    pub verification: VerificationConfig,
    /// Webhooks slice.
    pub webhooks: WebhooksConfig,
    /// Reminders slice.
    pub reminders: RemindersConfig,
    /// External KV backend; memory backend when absent.
    pub redis_url: Option<String>,
}

impl CoreConfig {
    /// Load configuration from the process environment. Unset variables use
    /// the restrictive defaults; a present-but-invalid value is a
    /// configuration error.
    pub fn from_env() -> CoreResult<Self> {
        let mut config = CoreConfig::default();

        if let Some(raw) = read("NOVA_ENV") {
            config.environment = raw
                .parse()
                .map_err(|e: String| CoreError::MalformedInput(e))?;
        }
        if let Some(raw) = read("LOG_LEVEL") {
            config.log.level = raw
                .parse()
                .map_err(|e: String| CoreError::MalformedInput(e))?;
        }
        config.log.redact = env_bool("LOG_REDACTION_ENABLED", config.log.redact)?;

        config.fetch.enabled = env_bool("WEB_FETCH_ENABLED", config.fetch.enabled)?;
        config.fetch.allow_private_ips =
            env_bool("WEB_FETCH_ALLOW_PRIVATE_IPS", config.fetch.allow_private_ips)?;
        config.fetch.allow_localhost =
            env_bool("WEB_FETCH_ALLOW_LOCALHOST", config.fetch.allow_localhost)?;
        config.fetch.validate_certs =
            env_bool("WEB_FETCH_VALIDATE_CERTS", config.fetch.validate_certs)?;
        config.fetch.connect_timeout_ms =
            env_u64("WEB_FETCH_CONNECT_TIMEOUT_MS", config.fetch.connect_timeout_ms)?;
        config.fetch.read_timeout_ms =
            env_u64("WEB_FETCH_READ_TIMEOUT_MS", config.fetch.read_timeout_ms)?;
        config.fetch.total_timeout_ms =
            env_u64("WEB_FETCH_TOTAL_TIMEOUT_MS", config.fetch.total_timeout_ms)?;
        config.fetch.max_response_bytes =
            env_u64("WEB_FETCH_MAX_RESPONSE_BYTES", config.fetch.max_response_bytes)?;
        config.fetch.max_redirects =
            env_u64("WEB_FETCH_MAX_REDIRECTS", config.fetch.max_redirects as u64)? as u32;
        if let Some(list) = env_list("WEB_FETCH_BLOCKED_HOSTNAMES") {
            config.fetch.blocked_hostnames = list;
        }
        if let Some(list) = env_list("WEB_FETCH_ALLOWED_HOSTNAMES") {
            config.fetch.allowed_hostnames = list;
        }
        if let Some(list) = env_list("WEB_FETCH_ALLOWED_PORTS") {
            let mut ports = Vec::with_capacity(list.len());
            for item in list {
                ports.push(item.parse::<u16>().map_err(|_| {
                    CoreError::MalformedInput(format!("invalid port '{}'", item))
                })?);
            }
            config.fetch.allowed_ports = Some(ports);
        }

        config.verification.enabled =
            env_bool("VERIFICATION_ENABLED", config.verification.enabled)?;
        config.verification.budget_ms =
            env_u64("VERIFICATION_BUDGET_MS", config.verification.budget_ms)?;
        config.verification.cache_ttl_secs =
            env_u64("VERIFICATION_CACHE_TTL_SECS", config.verification.cache_ttl_secs)?;
        if let Some(list) = env_list("VERIFICATION_TRUSTED_DOMAINS") {
            config.verification.trusted_domains = list;
        }

        config.webhooks.enabled = env_bool("WEBHOOKS_ENABLED", config.webhooks.enabled)?;
        config.webhooks.timeout_ms =
            env_u64("WEBHOOK_TIMEOUT_MS", config.webhooks.timeout_ms)?;

        config.reminders.enabled = env_bool("REMINDERS_ENABLED", config.reminders.enabled)?;

        config.redis_url = read("REDIS_URL");

        Ok(config)
    }
}

fn read(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> CoreResult<bool> {
    match read(name) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(CoreError::MalformedInput(format!(
                "{} must be a boolean, got '{}'",
                name, other
            ))),
        },
    }
}

fn env_u64(name: &str, default: u64) -> CoreResult<u64> {
    match read(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            CoreError::MalformedInput(format!("{} must be an integer, got '{}'", name, raw))
        }),
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    read(name).map(|raw| {
        raw.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_restrictive() {
        let config = CoreConfig::default();
        assert!(!config.fetch.enabled);
        assert!(!config.fetch.allow_private_ips);
        assert!(!config.fetch.allow_localhost);
        assert!(!config.fetch.allow_userinfo);
        assert!(config.fetch.validate_certs);
        assert!(config.fetch.block_idn);
        assert!(!config.verification.enabled);
        assert_eq!(config.fetch.allowed_ports, Some(vec![80, 443]));
    }

    #[test]
    fn blocklist_covers_metadata_endpoints() {
        let config = CoreConfig::default();
        assert!(config
            .fetch
            .blocked_hostnames
            .iter()
            .any(|h| h == "metadata.google.internal"));
        assert!(config
            .fetch
            .blocked_hostnames
            .iter()
            .any(|h| h == "169.254.169.254"));
    }

    #[test]
    fn environment_parsing() {
        assert_eq!("prod".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("dev".parse::<Environment>(), Ok(Environment::Development));
        assert!("weird".parse::<Environment>().is_err());
        assert!(Environment::Production.is_structured());
        assert!(!Environment::Development.is_structured());
    }
}
