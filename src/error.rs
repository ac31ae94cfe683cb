//! # Core Error Types
//!
//! Every public operation at a component boundary returns a typed error from
//! this module (or a module-local error that converts into it). The set of
//! kinds is finite: each failure in the system maps to exactly one
//! [`ErrorKind`]. Internal helpers may use richer error types, but the
//! outermost frame of each public method classifies into [`CoreError`]
//! before returning.
//!
//! Production rule: `Internal` errors are never exposed verbatim. Callers
//! surfacing errors to end users go through [`CoreError::user_message`],
//! which returns a generic sentinel for anything unclassified while the full
//! record goes to the logger.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Finite classification of every failure in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Parse failure of URL, claim, event, or configuration.
    MalformedInput,
    /// SSRF guard denial; the error carries a sub-reason.
    PolicyDenied,
    /// KV, DNS, or network unreachable.
    BackendUnavailable,
    /// Deadline exceeded on a specific stage.
    Timeout,
    /// Caller-initiated abort.
    Cancelled,
    /// Response body or payload exceeds a configured cap.
    TooLarge,
    /// Admission gate rejected: no valid identity.
    Unauthorized,
    /// Admission gate rejected: identity known, action not permitted.
    Forbidden,
    /// Shape mismatch, duplicate single-use token, or CAS failure.
    Conflict,
    /// Rate limiter reject; the error carries `retry_after` seconds.
    RateLimited,
    /// Upstream returned a terminal non-2xx.
    ProviderError,
    /// Unclassified; always logged with full detail.
    Internal,
}

/// Typed error crossing component boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input could not be parsed or validated.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The SSRF guard denied the request.
    #[error("policy denied: {reason}")]
    PolicyDenied {
        /// Sub-reason from the guard's classification tables.
        reason: String,
        /// Operator-facing detail; never shown to end users.
        detail: Option<String>,
    },

    /// A backing service (KV, DNS, network) could not be reached.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A stage-level deadline was exceeded.
    #[error("timeout during {stage}")]
    Timeout {
        /// Which stage hit its deadline (connect, read, total, dns).
        stage: &'static str,
    },

    /// The caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// A byte cap was exceeded.
    #[error("{what} exceeds cap of {limit} bytes")]
    TooLarge {
        /// What overflowed (response body, payload).
        what: &'static str,
        /// The configured cap in bytes.
        limit: u64,
    },

    /// No valid identity was presented.
    #[error("unauthorized")]
    Unauthorized,

    /// The identity is known but the action is not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Shape mismatch, duplicate single-use token, or lost CAS race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The rate limiter rejected the request.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the current window resets.
        retry_after_secs: u64,
    },

    /// An upstream provider returned a terminal failure.
    #[error("provider error (status {status:?})")]
    ProviderError {
        /// HTTP status when the upstream spoke HTTP.
        status: Option<u16>,
        /// Short description of the upstream failure.
        message: String,
    },

    /// Unclassified failure. Logged with detail, surfaced as a sentinel.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The finite kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MalformedInput(_) => ErrorKind::MalformedInput,
            CoreError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            CoreError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            CoreError::Timeout { .. } => ErrorKind::Timeout,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::TooLarge { .. } => ErrorKind::TooLarge,
            CoreError::Unauthorized => ErrorKind::Unauthorized,
            CoreError::Forbidden(_) => ErrorKind::Forbidden,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::RateLimited { .. } => ErrorKind::RateLimited,
            CoreError::ProviderError { .. } => ErrorKind::ProviderError,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry of the same operation could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendUnavailable
                | ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::ProviderError
        )
    }

    /// User-visible message. Policy denials collapse to a generic sentence
    /// and `Internal` never leaks its detail.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::MalformedInput(msg) => format!("Invalid input: {}", msg),
            CoreError::PolicyDenied { .. } => "URL not allowed".to_string(),
            CoreError::BackendUnavailable(_) => {
                "Service temporarily unavailable".to_string()
            }
            CoreError::Timeout { .. } => "The operation timed out".to_string(),
            CoreError::Cancelled => "The operation was cancelled".to_string(),
            CoreError::TooLarge { what, .. } => format!("The {} is too large", what),
            CoreError::Unauthorized => "Authentication required".to_string(),
            CoreError::Forbidden(_) => "Not permitted".to_string(),
            CoreError::Conflict(_) => "Conflicting request".to_string(),
            CoreError::RateLimited { retry_after_secs } => {
                format!("Too many requests, retry in {}s", retry_after_secs)
            }
            CoreError::ProviderError { .. } => "Upstream service failed".to_string(),
            CoreError::Internal(_) => "Something went wrong".to_string(),
        }
    }

    /// Shorthand for a policy denial with a reason code.
    pub fn denied(reason: impl Into<String>) -> Self {
        CoreError::PolicyDenied {
            reason: reason.into(),
            detail: None,
        }
    }
}

/// Result alias used throughout the core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            CoreError::MalformedInput("x".into()).kind(),
            ErrorKind::MalformedInput
        );
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            CoreError::RateLimited {
                retry_after_secs: 30
            }
            .kind(),
            ErrorKind::RateLimited
        );
    }

    #[test]
    fn internal_detail_never_reaches_users() {
        let err = CoreError::Internal("stack trace with secrets".into());
        assert!(!err.user_message().contains("secrets"));
    }

    #[test]
    fn policy_denials_collapse_to_sentinel() {
        let err = CoreError::PolicyDenied {
            reason: "PRIVATE_IP".into(),
            detail: Some("resolved to 10.0.0.8".into()),
        };
        assert_eq!(err.user_message(), "URL not allowed");
    }

    #[test]
    fn retryable_classification() {
        assert!(CoreError::BackendUnavailable("redis".into()).is_retryable());
        assert!(!CoreError::Unauthorized.is_retryable());
        assert!(!CoreError::denied("PORT_NOT_ALLOWED").is_retryable());
    }
}
