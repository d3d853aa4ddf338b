//! Auth error types and the classification seam used by the guard.

use thiserror::Error;

/// Result type for credential operations.
pub type AuthResult<T> = Result<T, AuthError>;

/// Errors raised while obtaining or refreshing a credential.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The refresh credential is missing, revoked or expired. Only a fresh
    /// sign-in can recover from this.
    #[error("Refresh credential rejected: {0}")]
    InvalidRefresh(String),

    /// Refresh failed for a reason that may go away (network, 5xx).
    #[error("Credential refresh failed: {0}")]
    RefreshFailed(String),

    #[error("No credential available")]
    NoCredential,

    #[error("Auth configuration error: {0}")]
    Config(String),
}

impl AuthError {
    pub fn invalid_refresh(msg: impl Into<String>) -> Self {
        Self::InvalidRefresh(msg.into())
    }

    pub fn refresh_failed(msg: impl Into<String>) -> Self {
        Self::RefreshFailed(msg.into())
    }

    /// True if the user must sign in again.
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, AuthError::InvalidRefresh(_) | AuthError::NoCredential)
    }
}

/// Message fragments that mark an error as authentication-related.
const AUTH_TERMS: &[&str] = &[
    "jwt",
    "expired",
    "unauthorized",
    "unauthenticated",
    "token",
    "session",
    "invalid_grant",
];

/// True for HTTP statuses that signal a rejected credential.
pub fn is_auth_status(status: u16) -> bool {
    status == 401 || status == 403
}

/// True if an error message looks like a rejected credential.
pub fn is_auth_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("401")
        || lower.contains("403")
        || AUTH_TERMS.iter().any(|term| lower.contains(term))
}

/// Errors that can pass through [`crate::AuthGuard::with_valid_credential`].
///
/// The default implementation classifies by status code first and falls back
/// to the rendered message.
pub trait AuthClassify: std::fmt::Display {
    /// HTTP status carried by the error, if any.
    fn status_code(&self) -> Option<u16> {
        None
    }

    fn is_auth_error(&self) -> bool {
        match self.status_code() {
            Some(status) if is_auth_status(status) => true,
            Some(_) => false,
            None => is_auth_message(&self.to_string()),
        }
    }
}

impl AuthClassify for AuthError {
    fn is_auth_error(&self) -> bool {
        self.requires_sign_in()
    }
}
