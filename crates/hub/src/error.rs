//! Error taxonomy shared by every component of the garden core.
//!
//! Component-internal faults (a failed sensor fetch, a failed background
//! refresh) are absorbed into view error flags; the variants here are what
//! mutating operations hand back to their caller.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Bad input. Never retried automatically.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Illegal state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transport error or timeout. Safe to retry with backoff.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The AI gateway is disconnected; the caller should offer manual entry.
    #[error("recommendation unavailable: {0}")]
    RecommendationUnavailable(String),
}

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn upstream(detail: impl std::fmt::Display) -> Self {
        Self::UpstreamUnavailable(detail.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_))
    }
}

/// Run a collaborator call under `limit`. An elapsed timer is reported as
/// `UpstreamUnavailable`, exactly like a transport failure.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(CoreError::UpstreamUnavailable(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
