use crate::twin::model::Twin;
use async_trait::async_trait;
use serde_json::Value;

/// Outcome of pushing a reported-properties patch upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedOutcome {
    /// Accepted by the cloud
    Accepted,
    /// Worth retrying after a backoff
    Transient,
    /// Rejected for good; the pending patch is dropped
    Permanent,
}

/// Upstream side of twin synchronization
///
/// Implementations wrap whatever transport bridges this gateway to the
/// cloud. Unreachability is a value, not an error: `get_twin` answers `None`
/// and `update_reported` answers [`ReportedOutcome::Transient`].
#[async_trait]
pub trait CloudSync: Send + Sync {
    /// Fetch the authoritative twin. `None` when the cloud is unreachable or
    /// the id is unknown upstream.
    async fn get_twin(&self, id: &str) -> Option<Twin>;

    /// Push a reported-properties patch upstream.
    async fn update_reported(&self, id: &str, patch: &Value) -> ReportedOutcome;
}
