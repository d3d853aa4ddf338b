//! Upload client error types.

use reel_auth::{AuthClassify, AuthError};
use reel_models::UploadId;
use thiserror::Error;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(UploadId),

    #[error("Upload already active: {0}")]
    AlreadyActive(UploadId),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Endpoint returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Upload worker has shut down")]
    WorkerGone,
}

impl UploadError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Transport failures worth another attempt on the same chunk.
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Network(e) => !e.is_builder() && !e.is_decode(),
            UploadError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            UploadError::Auth(e) => !e.requires_sign_in(),
            _ => false,
        }
    }
}

impl UploadError {
    /// The endpoint disagrees with the offset a chunk was sent at (tus 409).
    pub fn is_offset_conflict(&self) -> bool {
        matches!(self, UploadError::Http { status: 409, .. })
    }
}

impl AuthClassify for UploadError {
    fn status_code(&self) -> Option<u16> {
        match self {
            UploadError::Http { status, .. } => Some(*status),
            UploadError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn is_auth_error(&self) -> bool {
        match self {
            UploadError::Auth(e) => e.requires_sign_in(),
            UploadError::Http { status, .. } => reel_auth::is_auth_status(*status),
            _ => false,
        }
    }
}
