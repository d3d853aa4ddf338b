//! Credential sources.
//!
//! Two bindings are provided:
//! - [`FirebaseRefreshProvider`] exchanges a user's refresh token at the
//!   secure-token endpoint (client side, the upload CLI).
//! - [`ServiceAccountProvider`] mints OAuth tokens for a GCP service account
//!   (server side, Firestore access).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gcp_auth::TokenProvider;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::credential::Credential;
use crate::error::{AuthError, AuthResult};

/// OAuth scope for Firestore/Datastore access.
pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

/// Default secure-token endpoint.
pub const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

/// Conservative TTL when the source does not report one.
const DEFAULT_TTL: Duration = Duration::from_secs(50 * 60);

/// Something that can mint a fresh credential.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Exchange the current credential (if any) for a fresh one.
    ///
    /// Must return [`AuthError::InvalidRefresh`] when the refresh secret
    /// itself is rejected, and [`AuthError::RefreshFailed`] for transient
    /// failures.
    async fn refresh(&self, current: Option<&Credential>) -> AuthResult<Credential>;
}

// =============================================================================
// Firebase secure-token binding
// =============================================================================

#[derive(Debug, Deserialize)]
struct SecureTokenResponse {
    id_token: String,
    refresh_token: String,
    /// Seconds, sent as a string
    expires_in: String,
}

#[derive(Debug, Deserialize)]
struct SecureTokenErrorBody {
    error: SecureTokenError,
}

#[derive(Debug, Deserialize)]
struct SecureTokenError {
    message: String,
}

/// Error codes the secure-token endpoint uses for dead refresh tokens.
const DEAD_REFRESH_CODES: &[&str] = &[
    "TOKEN_EXPIRED",
    "INVALID_REFRESH_TOKEN",
    "MISSING_REFRESH_TOKEN",
    "USER_DISABLED",
    "USER_NOT_FOUND",
    "INVALID_GRANT_TYPE",
];

/// Refreshes a Firebase user session with its refresh token.
pub struct FirebaseRefreshProvider {
    http: Client,
    api_key: String,
    endpoint: String,
    initial_refresh_token: Option<String>,
}

impl FirebaseRefreshProvider {
    pub fn new(api_key: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self::with_endpoint(api_key, refresh_token, SECURE_TOKEN_URL)
    }

    pub fn with_endpoint(
        api_key: impl Into<String>,
        refresh_token: Option<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            initial_refresh_token: refresh_token,
        }
    }
}

#[async_trait]
impl CredentialProvider for FirebaseRefreshProvider {
    async fn refresh(&self, current: Option<&Credential>) -> AuthResult<Credential> {
        let refresh_token = current
            .and_then(|c| c.refresh_token.clone())
            .or_else(|| self.initial_refresh_token.clone())
            .ok_or_else(|| AuthError::invalid_refresh("MISSING_REFRESH_TOKEN"))?;

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AuthError::refresh_failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SecureTokenResponse = response
                .json()
                .await
                .map_err(|e| AuthError::refresh_failed(format!("invalid token response: {}", e)))?;
            let ttl = body
                .expires_in
                .parse::<u64>()
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TTL);
            debug!(ttl_secs = ttl.as_secs(), "Refreshed user credential");
            return Ok(Credential::expiring_in(body.id_token, Some(body.refresh_token), ttl));
        }

        let text = response.text().await.unwrap_or_default();
        let code = serde_json::from_str::<SecureTokenErrorBody>(&text)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| text.clone());

        if status.is_client_error() && DEAD_REFRESH_CODES.iter().any(|c| code.starts_with(c)) {
            Err(AuthError::invalid_refresh(code))
        } else {
            Err(AuthError::refresh_failed(format!("{}: {}", status, code)))
        }
    }
}

// =============================================================================
// Service-account binding
// =============================================================================

/// Mints OAuth access tokens for a service account via `gcp_auth`.
pub struct ServiceAccountProvider {
    auth: Arc<dyn TokenProvider>,
    scopes: Vec<String>,
}

impl ServiceAccountProvider {
    pub fn new(auth: Arc<dyn TokenProvider>) -> Self {
        Self {
            auth,
            scopes: vec![FIRESTORE_SCOPE.to_string()],
        }
    }

    /// Use the ambient application default credentials.
    pub async fn from_environment() -> AuthResult<Self> {
        let auth = gcp_auth::provider()
            .await
            .map_err(|e| AuthError::Config(format!("Failed to load service account: {}", e)))?;
        Ok(Self::new(auth))
    }
}

#[async_trait]
impl CredentialProvider for ServiceAccountProvider {
    async fn refresh(&self, _current: Option<&Credential>) -> AuthResult<Credential> {
        let scopes: Vec<&str> = self.scopes.iter().map(String::as_str).collect();
        let token = self
            .auth
            .token(&scopes)
            .await
            .map_err(|e| AuthError::refresh_failed(format!("Failed to obtain auth token: {}", e)))?;

        let now = Utc::now();
        let expires_at = if token.expires_at() > now {
            token.expires_at()
        } else {
            // Force a refresh on the next request.
            now
        };

        Ok(Credential::new(token.as_str(), None, expires_at))
    }
}
