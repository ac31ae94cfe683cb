//! # Nova Core
//!
//! Trust and transport core for the Nova personal-productivity backend.
//!
//! ## Architecture
//!
//! - `kv`: typed key/value substrate with TTLs, lists, sets, hashes, and
//!   atomic counters; in-memory and Redis backends
//! - `logging`: structured records with context propagation and PII
//!   redaction
//! - `flags`: static, dynamic, and per-user feature flags
//! - `net`: URL parsing, IP classification, SSRF guard, pinned secure
//!   transport, redirect guard
//! - `verify`: claim fingerprinting and cached verification verdicts
//! - `webhooks`: HMAC-signed webhook delivery with retries and backoff
//! - `trust`: rate limits, sessions, single-use tokens, blocks, veto
//!   history, audit log
//! - `reminders`: idempotent reminder dispatch with channel fallback
//! - `config`: explicit environment-driven configuration, restrictive by
//!   default
//! - `error`: the finite error-kind taxonomy every boundary speaks

#![warn(missing_docs)]
#![warn(clippy::all)]

// Configuration and errors - the vocabulary every component shares
pub mod config;
pub mod error;

// Shared utilities - clocks and cursors
pub mod util;

// Key/value substrate
pub mod kv;

// Structured logging
pub mod logging;

// Feature flags
pub mod flags;

// Network security stack
pub mod net;

// Claim verification
pub mod verify;

// Webhook delivery
pub mod webhooks;

// Trust stores
pub mod trust;

// Reminder scheduling
pub mod reminders;

// Re-export commonly used types
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use logging::{LogContext, LogLevel, Logger, LoggerConfig};
pub use net::{GuardedClient, SecureTransport, SsrfDecision, SsrfGuard};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
