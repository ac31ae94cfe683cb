//! IP address classification.
//!
//! The security core of the SSRF guard: every candidate address, literal or
//! resolved, is classified against fixed CIDR tables before any connection
//! is considered. Only [`IpClass::Public`] is safe by default; the
//! tunnel/mapping classes (IPv4-mapped, Teredo, 6to4) are safe only when the
//! IPv4 address they embed classifies as public. The `allow_private` and
//! `allow_loopback` toggles admit exactly their own class families and
//! nothing else.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Classes
// ============================================================================

/// Finite classification tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IpClass {
    LoopbackV4,
    LoopbackV6,
    Private10,
    Private172,
    Private192,
    /// IPv6 unique local addresses, `fc00::/7`.
    PrivateFc,
    LinkLocalV4,
    LinkLocalV6,
    CarrierGradeNat,
    MulticastV4,
    MulticastV6,
    DocumentationV4,
    DocumentationV6,
    Benchmarking,
    ThisNetwork,
    Reserved,
    Broadcast,
    Ipv4Mapped,
    Ipv4Translated,
    Teredo,
    #[serde(rename = "6TO4")]
    SixToFour,
    Public,
    Unknown,
}

impl IpClass {
    /// Whether this class is connectable with no toggles set. Only public
    /// space qualifies; the embedded-IPv4 classes are resolved by
    /// [`validate_ip`], which inspects the inner address.
    pub fn is_safe_by_default(&self) -> bool {
        matches!(self, IpClass::Public)
    }

    /// Whether the `allow_private` toggle covers this class.
    pub fn is_private_family(&self) -> bool {
        matches!(
            self,
            IpClass::Private10 | IpClass::Private172 | IpClass::Private192 | IpClass::PrivateFc
        )
    }

    /// Whether the `allow_loopback` toggle covers this class.
    pub fn is_loopback_family(&self) -> bool {
        matches!(self, IpClass::LoopbackV4 | IpClass::LoopbackV6)
    }
}

impl std::fmt::Display for IpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            IpClass::LoopbackV4 => "LOOPBACK_V4",
            IpClass::LoopbackV6 => "LOOPBACK_V6",
            IpClass::Private10 => "PRIVATE_10",
            IpClass::Private172 => "PRIVATE_172",
            IpClass::Private192 => "PRIVATE_192",
            IpClass::PrivateFc => "PRIVATE_FC",
            IpClass::LinkLocalV4 => "LINK_LOCAL_V4",
            IpClass::LinkLocalV6 => "LINK_LOCAL_V6",
            IpClass::CarrierGradeNat => "CARRIER_GRADE_NAT",
            IpClass::MulticastV4 => "MULTICAST_V4",
            IpClass::MulticastV6 => "MULTICAST_V6",
            IpClass::DocumentationV4 => "DOCUMENTATION_V4",
            IpClass::DocumentationV6 => "DOCUMENTATION_V6",
            IpClass::Benchmarking => "BENCHMARKING",
            IpClass::ThisNetwork => "THIS_NETWORK",
            IpClass::Reserved => "RESERVED",
            IpClass::Broadcast => "BROADCAST",
            IpClass::Ipv4Mapped => "IPV4_MAPPED",
            IpClass::Ipv4Translated => "IPV4_TRANSLATED",
            IpClass::Teredo => "TEREDO",
            IpClass::SixToFour => "6TO4",
            IpClass::Public => "PUBLIC",
            IpClass::Unknown => "UNKNOWN",
        };
        f.write_str(tag)
    }
}

// ============================================================================
// IPv4
// ============================================================================

struct Cidr4 {
    base: u32,
    prefix: u32,
    class: IpClass,
}

const fn cidr(a: u8, b: u8, c: u8, d: u8, prefix: u32, class: IpClass) -> Cidr4 {
    Cidr4 {
        base: u32::from_be_bytes([a, b, c, d]),
        prefix,
        class,
    }
}

/// First-match table; order is load-bearing (broadcast before reserved,
/// documentation before multicast's wider neighbours).
const V4_TABLE: [Cidr4; 14] = [
    cidr(127, 0, 0, 0, 8, IpClass::LoopbackV4),
    cidr(10, 0, 0, 0, 8, IpClass::Private10),
    cidr(172, 16, 0, 0, 12, IpClass::Private172),
    cidr(192, 168, 0, 0, 16, IpClass::Private192),
    cidr(169, 254, 0, 0, 16, IpClass::LinkLocalV4),
    cidr(100, 64, 0, 0, 10, IpClass::CarrierGradeNat),
    cidr(224, 0, 0, 0, 4, IpClass::MulticastV4),
    cidr(192, 0, 2, 0, 24, IpClass::DocumentationV4),
    cidr(198, 51, 100, 0, 24, IpClass::DocumentationV4),
    cidr(203, 0, 113, 0, 24, IpClass::DocumentationV4),
    cidr(198, 18, 0, 0, 15, IpClass::Benchmarking),
    cidr(0, 0, 0, 0, 8, IpClass::ThisNetwork),
    cidr(255, 255, 255, 255, 32, IpClass::Broadcast),
    cidr(192, 0, 0, 0, 24, IpClass::Reserved),
];

fn in_cidr(ip: u32, base: u32, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix);
    (ip & mask) == (base & mask)
}

/// Classify an IPv4 address by first match over the fixed CIDR table.
pub fn classify_v4(ip: Ipv4Addr) -> IpClass {
    let bits = u32::from(ip);
    for entry in &V4_TABLE {
        if in_cidr(bits, entry.base, entry.prefix) {
            return entry.class;
        }
    }
    // 240.0.0.0/4 minus broadcast.
    if in_cidr(bits, u32::from_be_bytes([240, 0, 0, 0]), 4) {
        return IpClass::Reserved;
    }
    IpClass::Public
}

// ============================================================================
// IPv6
// ============================================================================

/// Classify an IPv6 address; tunnel/mapping classes are tagged as such and
/// their embedded IPv4 is extracted separately by [`embedded_ipv4`].
pub fn classify_v6(ip: Ipv6Addr) -> IpClass {
    let s = ip.segments();

    if ip == Ipv6Addr::LOCALHOST {
        return IpClass::LoopbackV6;
    }
    if ip == Ipv6Addr::UNSPECIFIED {
        return IpClass::ThisNetwork;
    }
    // ::ffff:0:0/96, IPv4-mapped.
    if s[0] == 0 && s[1] == 0 && s[2] == 0 && s[3] == 0 && s[4] == 0 && s[5] == 0xffff {
        return IpClass::Ipv4Mapped;
    }
    // ::ffff:0:0:0/96, IPv4-translated (SIIT).
    if s[0] == 0 && s[1] == 0 && s[2] == 0 && s[3] == 0 && s[4] == 0xffff && s[5] == 0 {
        return IpClass::Ipv4Translated;
    }
    // fe80::/10
    if s[0] & 0xffc0 == 0xfe80 {
        return IpClass::LinkLocalV6;
    }
    // fc00::/7, unique local.
    if s[0] & 0xfe00 == 0xfc00 {
        return IpClass::PrivateFc;
    }
    // ff00::/8
    if s[0] & 0xff00 == 0xff00 {
        return IpClass::MulticastV6;
    }
    // 2001:db8::/32
    if s[0] == 0x2001 && s[1] == 0x0db8 {
        return IpClass::DocumentationV6;
    }
    // 2001::/32, Teredo.
    if s[0] == 0x2001 && s[1] == 0x0000 {
        return IpClass::Teredo;
    }
    // 2002::/16, 6to4.
    if s[0] == 0x2002 {
        return IpClass::SixToFour;
    }
    IpClass::Public
}

/// Extract the IPv4 address embedded in a mapped/translated/tunnel IPv6
/// address, when the class carries one.
pub fn embedded_ipv4(ip: Ipv6Addr, class: IpClass) -> Option<Ipv4Addr> {
    let s = ip.segments();
    match class {
        IpClass::Ipv4Mapped | IpClass::Ipv4Translated => Some(Ipv4Addr::new(
            (s[6] >> 8) as u8,
            (s[6] & 0xff) as u8,
            (s[7] >> 8) as u8,
            (s[7] & 0xff) as u8,
        )),
        // Teredo stores the client IPv4 in the last 32 bits, inverted.
        IpClass::Teredo => {
            let inverted = ((s[6] as u32) << 16) | s[7] as u32;
            Some(Ipv4Addr::from(!inverted))
        }
        // 6to4 stores it in bits 16..48.
        IpClass::SixToFour => Some(Ipv4Addr::new(
            (s[1] >> 8) as u8,
            (s[1] & 0xff) as u8,
            (s[2] >> 8) as u8,
            (s[2] & 0xff) as u8,
        )),
        _ => None,
    }
}

/// Classify either family.
pub fn classify(ip: IpAddr) -> IpClass {
    match ip {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => classify_v6(v6),
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Safety toggles. Each toggle admits only its own class family; every
/// other unsafe class stays unsafe regardless.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpPolicy {
    /// Admit the private families (10/8, 172.16/12, 192.168/16, fc00::/7).
    pub allow_private: bool,
    /// Admit loopback.
    pub allow_loopback: bool,
}

/// Outcome of validating one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpValidationResult {
    /// The address that was validated.
    pub ip: IpAddr,
    /// Canonical textual form: dotted-quad for IPv4; IPv6 with the longest
    /// zero run collapsed (RFC 5952, as produced by the standard library).
    pub canonical: String,
    /// Classification tag.
    pub class: IpClass,
    /// IPv4 embedded in a mapped/tunnel address, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded: Option<Ipv4Addr>,
    /// Whether the address is connectable under the given policy.
    pub is_safe: bool,
}

/// Validate an address against the classification tables and a policy.
pub fn validate_ip(ip: IpAddr, policy: IpPolicy) -> IpValidationResult {
    let class = classify(ip);

    let embedded = match ip {
        IpAddr::V6(v6) => embedded_ipv4(v6, class),
        IpAddr::V4(_) => None,
    };

    let is_safe = if class.is_safe_by_default() {
        true
    } else if let Some(inner) = embedded {
        // Mapped/tunnel classes inherit safety from the embedded IPv4, which
        // must itself be public; toggles do not reach through the mapping.
        classify_v4(inner) == IpClass::Public
    } else if class.is_private_family() {
        policy.allow_private
    } else if class.is_loopback_family() {
        policy.allow_loopback
    } else {
        false
    };

    IpValidationResult {
        ip,
        canonical: ip.to_string(),
        class,
        embedded,
        is_safe,
    }
}
