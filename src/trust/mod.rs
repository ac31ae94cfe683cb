//! # Trust Stores
//!
//! Small façades over the KV store, read by request admission and written
//! by outcome handlers:
//!
//! - **Rate limits** (`rate_limit`): fixed-window atomic counters
//! - **Sessions** (`session`): conversation state as hashes
//! - **Ack tokens** (`ack_token`): single-use, atomically consumed
//! - **Blocks** (`block`): TTL'd user blocks
//! - **Veto history** (`veto`): windowed safety-veto counters
//! - **Audit log** (`audit`): capped per-user and global lists
//! - **Analytics buffer** (`analytics`): lossless buffered event flush
//!
//! Each record is created and updated by the component that produced the
//! observation; the admission gate only reads.

use std::sync::Arc;

pub mod ack_token;
pub mod analytics;
pub mod audit;
pub mod block;
pub mod rate_limit;
pub mod session;
pub mod veto;

pub use ack_token::AckTokenStore;
pub use analytics::{AnalyticsEvent, EventBuffer};
pub use audit::{AuditEntry, AuditLogStore};
pub use block::{BlockRecord, BlockStatus, BlockStore};
pub use rate_limit::{RateLimitStatus, RateLimitStore};
pub use session::{Session, SessionStore};
pub use veto::VetoHistoryStore;

use crate::error::{CoreError, CoreResult};

/// Admission decision inputs for one request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    /// Acting user.
    pub user_id: &'a str,
    /// Rate-limit window in seconds.
    pub window_secs: u64,
    /// Requests allowed per window.
    pub limit: u64,
}

/// Read-side gate combining block state and rate limits.
///
/// The gate never writes trust records other than the rate counter it
/// consumes; blocks and vetoes are written by their owning components.
pub struct AdmissionGate {
    blocks: Arc<BlockStore>,
    rate_limits: Arc<RateLimitStore>,
}

impl AdmissionGate {
    /// Compose a gate from the stores it reads.
    pub fn new(blocks: Arc<BlockStore>, rate_limits: Arc<RateLimitStore>) -> Self {
        Self {
            blocks,
            rate_limits,
        }
    }

    /// Admit or reject one request. Blocks reject with `FORBIDDEN`; rate
    /// limits reject with `RATE_LIMITED` carrying `retry_after`.
    pub async fn admit(&self, request: AdmissionRequest<'_>) -> CoreResult<RateLimitStatus> {
        let status = self.blocks.is_blocked(request.user_id).await?;
        if status.blocked {
            return Err(CoreError::Forbidden(
                status.reason.unwrap_or_else(|| "blocked".to_string()),
            ));
        }
        self.rate_limits
            .enforce(request.user_id, request.window_secs, request.limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kv::MemoryKv;

    #[tokio::test]
    async fn gate_rejects_blocked_users_before_counting() {
        let kv = Arc::new(MemoryKv::new());
        let blocks = Arc::new(BlockStore::new(kv.clone()));
        let rate_limits = Arc::new(RateLimitStore::new(kv.clone()));
        let gate = AdmissionGate::new(blocks.clone(), rate_limits);

        blocks.block("user-1", "abuse", 3600).await.unwrap();
        let err = gate
            .admit(AdmissionRequest {
                user_id: "user-1",
                window_secs: 60,
                limit: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn gate_rate_limits_unblocked_users() {
        let kv = Arc::new(MemoryKv::new());
        let gate = AdmissionGate::new(
            Arc::new(BlockStore::new(kv.clone())),
            Arc::new(RateLimitStore::new(kv)),
        );

        let request = AdmissionRequest {
            user_id: "user-1",
            window_secs: 60,
            limit: 2,
        };
        assert_eq!(gate.admit(request.clone()).await.unwrap().count, 1);
        assert_eq!(gate.admit(request.clone()).await.unwrap().count, 2);
        let err = gate.admit(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
    }
}
