//! # SSRF Guard
//!
//! The orchestrator that turns an untrusted URL into an explicit transport
//! decision. `check()` walks a fixed pipeline (parse, userinfo, port
//! policy, encoding detectors, IDN policy, hostname block/allow lists, IP
//! validation, DNS resolution) and either denies with a reason code or
//! produces [`TransportRequirements`] pinned to a validated address.
//!
//! The anti-rebinding property lives here: the address the guard classified
//! is the address transport will connect to. A second DNS lookup never
//! happens between decision and connect.
//!
//! The decision is pure apart from DNS cache writes, records one
//! [`CheckStep`] per pipeline stage, and is safe to log.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dns::Resolver;
use super::ip::{validate_ip, IpClass, IpPolicy};
use super::url::{parse_url, ParsedUrl};
use crate::config::{FetchConfig, PinMode};
use crate::logging::{LogContext, LogOptions, Logger, LogLevel};
use crate::util::{Clock, SystemClock};

// ============================================================================
// Decision types
// ============================================================================

/// One pipeline stage, attempted or failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStep {
    /// Stage name.
    pub name: String,
    /// Whether the stage passed.
    pub passed: bool,
    /// Stage-specific detail (decoded IPs, matched patterns).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Everything transport needs to perform exactly one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRequirements {
    /// The URL as the caller supplied it.
    pub original_url: String,
    /// The validated address to open the TCP connection to.
    pub connect_to_ip: IpAddr,
    /// Destination port.
    pub port: u16,
    /// Whether to negotiate TLS.
    pub use_tls: bool,
    /// Hostname for SNI and the `Host:` header.
    pub hostname: String,
    /// Path plus query for the request line.
    pub request_path: String,
    /// Body byte cap.
    pub max_response_bytes: u64,
    /// Connect deadline.
    pub connect_timeout_ms: u64,
    /// Read deadline.
    pub read_timeout_ms: u64,
    /// Whole-request deadline.
    pub total_timeout_ms: u64,
    /// Whether the redirect guard may follow 3xx.
    pub allow_redirects: bool,
    /// Redirect hop budget.
    pub max_redirects: u32,
    /// SPKI SHA-256 pins, lowercase hex; empty disables pinning.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub certificate_pins: Vec<String>,
    /// Pin mismatch handling.
    #[serde(skip)]
    pub pin_mode: PinModeField,
}

/// Serde-skipped wrapper defaulting to enforcement.
#[derive(Debug, Clone, Copy)]
pub struct PinModeField(pub PinMode);

impl Default for PinModeField {
    fn default() -> Self {
        PinModeField(PinMode::Enforce)
    }
}

/// The guard's verdict for one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrfDecision {
    /// Whether transport may proceed. True iff `transport` is present.
    pub allowed: bool,
    /// Reason code on denial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
    /// Operator-facing denial message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// One entry per attempted stage.
    pub checks: Vec<CheckStep>,
    /// Wall-clock cost of the whole check.
    pub duration_ms: u64,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Present exactly when `allowed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportRequirements>,
}

/// Reason code for an unsafe IP class.
pub fn deny_reason_for_class(class: IpClass) -> &'static str {
    match class {
        IpClass::LoopbackV4 | IpClass::LoopbackV6 => "LOOPBACK_IP",
        IpClass::Private10 | IpClass::Private172 | IpClass::Private192 | IpClass::PrivateFc => {
            "PRIVATE_IP"
        }
        IpClass::LinkLocalV4 | IpClass::LinkLocalV6 => "LINK_LOCAL_IP",
        IpClass::CarrierGradeNat => "CARRIER_GRADE_NAT_IP",
        IpClass::MulticastV4 | IpClass::MulticastV6 => "MULTICAST_IP",
        IpClass::DocumentationV4 | IpClass::DocumentationV6 => "DOCUMENTATION_IP",
        IpClass::Benchmarking => "BENCHMARKING_IP",
        IpClass::ThisNetwork => "THIS_NETWORK_IP",
        IpClass::Broadcast => "BROADCAST_IP",
        IpClass::Ipv4Mapped | IpClass::Ipv4Translated | IpClass::Teredo | IpClass::SixToFour => {
            "TUNNELED_PRIVATE_IP"
        }
        IpClass::Reserved | IpClass::Unknown => "RESERVED_IP",
        IpClass::Public => "PUBLIC",
    }
}

// ============================================================================
// Guard
// ============================================================================

/// SSRF guard over a fetch policy and a resolver.
pub struct SsrfGuard {
    config: FetchConfig,
    resolver: Arc<dyn Resolver>,
    logger: Logger,
    clock: Arc<dyn Clock>,
}

impl SsrfGuard {
    /// Build a guard. The resolver should be the caching resolver in
    /// production so repeat checks do not hammer DNS.
    pub fn new(config: FetchConfig, resolver: Arc<dyn Resolver>, logger: &Logger) -> Self {
        Self {
            config,
            resolver,
            logger: logger.child(LogContext::component("ssrf-guard")),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluate a URL. Never errors: every failure is a denial with a
    /// reason code.
    pub async fn check(&self, url: &str) -> SsrfDecision {
        let started = Instant::now();
        let mut checks: Vec<CheckStep> = Vec::new();

        let decision = self.run_pipeline(url, &mut checks).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let decision = match decision {
            Ok(transport) => SsrfDecision {
                allowed: true,
                deny_reason: None,
                message: None,
                checks,
                duration_ms,
                timestamp: self.clock.now(),
                transport: Some(transport),
            },
            Err(denial) => SsrfDecision {
                allowed: false,
                deny_reason: Some(denial.reason.clone()),
                message: Some(denial.message),
                checks,
                duration_ms,
                timestamp: self.clock.now(),
                transport: None,
            },
        };

        let level = if decision.allowed {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        };
        self.logger.log(
            level,
            if decision.allowed {
                "outbound url allowed"
            } else {
                "outbound url denied"
            },
            LogOptions {
                metadata: serde_json::to_value(&decision).ok(),
                duration_ms: Some(decision.duration_ms),
                ..LogOptions::default()
            },
        );

        decision
    }

    async fn run_pipeline(
        &self,
        url: &str,
        checks: &mut Vec<CheckStep>,
    ) -> Result<TransportRequirements, Denial> {
        // 1. Parse.
        let parsed = match parse_url(url) {
            Ok(parsed) => {
                pass(checks, "parse_url", None);
                parsed
            }
            Err(err) => {
                fail(checks, "parse_url", Some(err.to_string()));
                return Err(Denial::new("MALFORMED_URL", "URL could not be parsed"));
            }
        };

        // 2. Userinfo.
        if parsed.userinfo.is_some() && !self.config.allow_userinfo {
            fail(checks, "userinfo", Some("credentials present in authority".into()));
            return Err(Denial::new(
                "USERINFO_PRESENT",
                "URLs with embedded credentials are not allowed",
            ));
        }
        pass(checks, "userinfo", None);

        // 3. Port policy.
        let port = parsed.effective_port();
        if let Some(allowed) = &self.config.allowed_ports {
            if !allowed.contains(&port) {
                fail(checks, "port_policy", Some(format!("port {}", port)));
                return Err(Denial::new(
                    "PORT_NOT_ALLOWED",
                    format!("port {} is outside the allowed set", port),
                ));
            }
        }
        pass(checks, "port_policy", Some(format!("port {}", port)));

        // 4. Alternate IP encodings.
        if let Some(alt) = parsed.alternate_encoding {
            if self.config.detect_alternate_encoding {
                fail(
                    checks,
                    "alternate_encoding",
                    Some(format!("{:?} encoding of {}", alt.kind, alt.decoded)),
                );
                return Err(Denial::new(
                    "ALTERNATE_IP_ENCODING",
                    format!("hostname is {} written as {:?}", alt.decoded, alt.kind),
                ));
            }
        }
        pass(checks, "alternate_encoding", None);

        // 5. Embedded IPs.
        if let Some(embedded) = parsed.embedded_ip {
            if self.config.detect_embedded_ip {
                fail(checks, "embedded_ip", Some(embedded.to_string()));
                return Err(Denial::new(
                    "EMBEDDED_IP_IN_HOSTNAME",
                    format!("hostname embeds {}", embedded),
                ));
            }
        }
        pass(checks, "embedded_ip", None);

        // 6. IDN policy.
        if parsed.is_idn && self.config.block_idn {
            fail(checks, "idn", Some(parsed.hostname.clone()));
            return Err(Denial::new(
                "IDN_HOMOGRAPH",
                "internationalized hostnames are not allowed",
            ));
        }
        pass(checks, "idn", None);

        // 7. Hostname blocklist.
        if let Some(pattern) = self
            .config
            .blocked_hostnames
            .iter()
            .find(|p| hostname_matches(p, &parsed.hostname))
        {
            fail(checks, "hostname_blocklist", Some(pattern.clone()));
            return Err(Denial::new(
                "HOSTNAME_BLOCKED",
                format!("hostname matches blocked pattern '{}'", pattern),
            ));
        }
        pass(checks, "hostname_blocklist", None);

        // 8. Hostname allowlist.
        if !self.config.allowed_hostnames.is_empty()
            && !self
                .config
                .allowed_hostnames
                .iter()
                .any(|p| hostname_matches(p, &parsed.hostname))
        {
            fail(checks, "hostname_allowlist", Some(parsed.hostname.clone()));
            return Err(Denial::new(
                "HOSTNAME_NOT_IN_ALLOWLIST",
                "hostname is not in the allowlist",
            ));
        }
        pass(checks, "hostname_allowlist", None);

        let policy = IpPolicy {
            allow_private: self.config.allow_private_ips,
            allow_loopback: self.config.allow_localhost,
        };

        // 9–10. Literal validation, or resolve-then-validate.
        let connect_to_ip = match parsed.ip_literal {
            Some(ip) => {
                let result = validate_ip(ip, policy);
                if !result.is_safe {
                    fail(
                        checks,
                        "ip_literal",
                        Some(format!("{} is {}", result.canonical, result.class)),
                    );
                    return Err(Denial::new(
                        deny_reason_for_class(result.class),
                        format!("address {} is not connectable", result.canonical),
                    ));
                }
                pass(checks, "ip_literal", Some(result.canonical));
                ip
            }
            None => self.resolve_and_validate(&parsed, policy, checks).await?,
        };

        Ok(self.transport_for(url, &parsed, connect_to_ip, port))
    }

    /// Resolve every address and validate each one; any unsafe answer fails
    /// the whole check; the guard never falls back to a safe address among
    /// a mixed answer.
    async fn resolve_and_validate(
        &self,
        parsed: &ParsedUrl,
        policy: IpPolicy,
        checks: &mut Vec<CheckStep>,
    ) -> Result<IpAddr, Denial> {
        let addresses = match self.resolver.resolve(&parsed.hostname).await {
            Ok(addresses) => {
                pass(
                    checks,
                    "dns_resolution",
                    Some(format!("{} addresses", addresses.len())),
                );
                addresses
            }
            Err(err) => {
                fail(checks, "dns_resolution", Some(err.to_string()));
                return Err(Denial::new(
                    "DNS_RESOLUTION_FAILED",
                    "hostname did not resolve",
                ));
            }
        };

        let mut validated = Vec::with_capacity(addresses.len());
        for address in addresses {
            let result = validate_ip(address, policy);
            if !result.is_safe {
                fail(
                    checks,
                    "resolved_ip",
                    Some(format!("{} is {}", result.canonical, result.class)),
                );
                return Err(Denial::new(
                    deny_reason_for_class(result.class),
                    format!("resolved address {} is not connectable", result.canonical),
                ));
            }
            validated.push(result);
        }

        // Deterministic tie-break: smallest canonical text.
        validated.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        let chosen = validated
            .first()
            .ok_or_else(|| Denial::new("DNS_RESOLUTION_FAILED", "empty resolution"))?;
        pass(checks, "resolved_ip", Some(chosen.canonical.clone()));
        Ok(chosen.ip)
    }

    fn transport_for(
        &self,
        original_url: &str,
        parsed: &ParsedUrl,
        connect_to_ip: IpAddr,
        port: u16,
    ) -> TransportRequirements {
        TransportRequirements {
            original_url: original_url.to_string(),
            connect_to_ip,
            port,
            use_tls: parsed.uses_tls(),
            hostname: parsed.hostname.clone(),
            request_path: parsed.request_path(),
            max_response_bytes: self.config.max_response_bytes,
            connect_timeout_ms: self.config.connect_timeout_ms,
            read_timeout_ms: self.config.read_timeout_ms,
            total_timeout_ms: self.config.total_timeout_ms,
            allow_redirects: self.config.allow_redirects,
            max_redirects: self.config.max_redirects,
            certificate_pins: self.config.certificate_pins.clone(),
            pin_mode: PinModeField(self.config.pin_mode),
        }
    }
}

/// Case-insensitive suffix match: `foo` matches `foo` and `sub.foo`.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let hostname = hostname.to_lowercase();
    hostname == pattern || hostname.ends_with(&format!(".{}", pattern))
}

struct Denial {
    reason: String,
    message: String,
}

impl Denial {
    fn new(reason: &str, message: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

fn pass(checks: &mut Vec<CheckStep>, name: &str, details: Option<String>) {
    checks.push(CheckStep {
        name: name.to_string(),
        passed: true,
        details,
    });
}

fn fail(checks: &mut Vec<CheckStep>, name: &str, details: Option<String>) {
    checks.push(CheckStep {
        name: name.to_string(),
        passed: false,
        details,
    });
}
