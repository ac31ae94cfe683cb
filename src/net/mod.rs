//! # Network Security Stack
//!
//! Everything between an untrusted URL string and a bounded HTTP response:
//!
//! 1. **Parsing and analysis** (`url`): RFC-compliant parse, IDN
//!    conversion, alternate-encoding and embedded-IP detection
//! 2. **Classification** (`ip`): fixed CIDR tables deciding which address
//!    space is connectable
//! 3. **Resolution** (`dns`): A/AAAA lookup behind a trait, cached in the
//!    KV store
//! 4. **Decision** (`ssrf`): the guard pipeline producing a transport
//!    decision pinned to a validated IP
//! 5. **Execution** (`transport`): one pinned-IP request with byte caps,
//!    deadlines, and SPKI pinning
//! 6. **Redirects** (`redirect`): every hop re-guarded, loops detected

pub mod dns;
pub mod ip;
pub mod pin;
pub mod redirect;
pub mod ssrf;
pub mod transport;
pub mod url;

pub use dns::{CachingResolver, Resolver, StaticResolver, SystemResolver};
pub use ip::{classify, classify_v4, classify_v6, validate_ip, IpClass, IpPolicy, IpValidationResult};
pub use redirect::GuardedClient;
pub use ssrf::{CheckStep, SsrfDecision, SsrfGuard, TransportRequirements};
pub use transport::{
    HttpTransport, OutboundRequest, ScriptedTransport, SecureTransport, TransportError,
    TransportResponse,
};
pub use url::{parse_url, ParsedUrl};
