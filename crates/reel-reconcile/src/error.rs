//! Reconciliation error types.

use reel_firestore::FirestoreError;
use reel_provider::ProviderError;
use thiserror::Error;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No session is bound to provider job {0}")]
    UnknownProviderJob(String),

    #[error("Session {0} already has an active job")]
    JobActive(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Record changed concurrently: {0}")]
    VersionConflict(String),

    #[error("Gave up after {0} conflicting writes")]
    ConflictExhausted(u32),

    #[error("Store error: {0}")]
    Store(#[from] FirestoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl ReconcileError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound(id.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for lookups that matched nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReconcileError::SessionNotFound(_) | ReconcileError::UnknownProviderJob(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::VersionConflict(_) => true,
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}
