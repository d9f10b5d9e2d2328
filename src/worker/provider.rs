use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::worker::registry::{WorkerId, WorkerStatus};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("worker launch failed: {reason}")]
    Launch { reason: String, retryable: bool },

    #[error("worker not found: {0}")]
    NotFound(WorkerId),

    #[error("failed to stop worker {id}: {reason}")]
    Stop { id: WorkerId, reason: String },

    #[error("worker provider unavailable: {0}")]
    Unavailable(String),

    #[error("worker provider call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ProviderError {
    /// Whether retrying the same call on a later tick can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Launch { retryable, .. } => *retryable,
            ProviderError::NotFound(_) => false,
            ProviderError::Stop { .. }
            | ProviderError::Unavailable(_)
            | ProviderError::Timeout(_) => true,
        }
    }
}

/// A worker as the provider reports it, used to rebuild the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderWorker {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub launched_at: DateTime<Utc>,
}

/// Starts, inspects and stops remote compute units.
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Start one worker unit and return its identifier.
    async fn launch(&self) -> Result<WorkerId, ProviderError>;

    async fn describe(&self, id: &str) -> Result<WorkerStatus, ProviderError>;

    /// Stopping an already stopped worker succeeds.
    async fn stop(&self, id: &str) -> Result<(), ProviderError>;

    /// Workers tagged with this scheduler's identity, in any state.
    async fn list_owned(&self) -> Result<Vec<ProviderWorker>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_errors_carry_their_retry_flag() {
        let transient = ProviderError::Launch {
            reason: "throttled".into(),
            retryable: true,
        };
        let permanent = ProviderError::Launch {
            reason: "no such image".into(),
            retryable: false,
        };
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(ProviderError::Timeout(std::time::Duration::from_secs(1)).is_retryable());
        assert!(!ProviderError::NotFound("w".into()).is_retryable());
    }
}
