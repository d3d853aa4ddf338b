//! Bearer token authentication.
//!
//! Production verifies Firebase ID tokens (RS256, Google JWKS). Deployments
//! that mint their own tokens, and the test suite, use an HS256 shared secret.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::state::AppState;

/// Google JWKS URL for Firebase Auth.
const GOOGLE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

/// Firebase token issuer prefix.
const FIREBASE_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// JWKS cache TTL.
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600); // 1 hour

/// Decoded ID token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User ID
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    /// Expiration
    pub exp: i64,
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub email_verified: bool,
}

impl From<TokenClaims> for AuthUser {
    fn from(claims: TokenClaims) -> Self {
        Self {
            uid: claims.sub,
            email: claims.email,
            email_verified: claims.email_verified.unwrap_or(false),
        }
    }
}

/// JWKS response from Google.
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Clone, Deserialize)]
struct JwkKey {
    kid: String,
    n: String,
    e: String,
}

/// Cached Firebase signing keys.
pub struct JwksCache {
    http: Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    last_refresh: RwLock<Option<Instant>>,
    project_id: String,
}

impl JwksCache {
    /// Keys are fetched on first use.
    pub fn new(project_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build JWKS HTTP client")?;

        Ok(Self {
            http,
            keys: RwLock::new(HashMap::new()),
            last_refresh: RwLock::new(None),
            project_id: project_id.into(),
        })
    }

    /// Refresh JWKS keys from Google.
    async fn refresh_keys(&self) -> anyhow::Result<()> {
        debug!("Refreshing JWKS keys");

        let response = self.http.get(GOOGLE_JWKS_URL).send().await?;
        let jwks: JwksResponse = response.error_for_status()?.json().await?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;
            keys.insert(jwk.kid, key);
        }

        let key_count = keys.len();
        *self.keys.write().await = keys;
        *self.last_refresh.write().await = Some(Instant::now());

        debug!("Refreshed {} JWKS keys", key_count);
        Ok(())
    }

    /// Get decoding key for a key ID.
    async fn get_key(&self, kid: &str) -> Option<DecodingKey> {
        let stale = self
            .last_refresh
            .read()
            .await
            .map(|at| at.elapsed() > JWKS_CACHE_TTL)
            .unwrap_or(true);
        let unknown = !self.keys.read().await.contains_key(kid);

        // Google rotates keys; an unknown kid also forces a refresh.
        if stale || unknown {
            if let Err(e) = self.refresh_keys().await {
                warn!("Failed to refresh JWKS keys: {}", e);
            }
        }

        self.keys.read().await.get(kid).cloned()
    }

    /// Verify a Firebase ID token.
    pub async fn verify_token(&self, token: &str) -> Result<TokenClaims, ApiError> {
        let header = decode_header(token)
            .map_err(|e| ApiError::unauthorized(format!("Invalid token header: {}", e)))?;

        let kid = header
            .kid
            .ok_or_else(|| ApiError::unauthorized("Token missing key ID"))?;

        let key = self
            .get_key(&kid)
            .await
            .ok_or_else(|| ApiError::unauthorized("Unknown key ID"))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[format!("{}{}", FIREBASE_ISSUER_PREFIX, self.project_id)]);
        validation.set_audience(&[&self.project_id]);

        let token_data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| ApiError::unauthorized(format!("Token validation failed: {}", e)))?;

        Ok(token_data.claims)
    }
}

/// Verifies bearer tokens presented to the API.
pub enum TokenVerifier {
    /// HS256 tokens signed with a shared secret
    SharedSecret {
        key: DecodingKey,
        validation: Validation,
    },
    /// Firebase ID tokens
    Firebase(JwksCache),
}

impl TokenVerifier {
    pub fn shared_secret(secret: &str, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        Self::SharedSecret {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn firebase(project_id: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self::Firebase(JwksCache::new(project_id)?))
    }

    /// Shared secret when `AUTH_JWT_SECRET` is set, Firebase otherwise.
    pub fn from_config(config: &ApiConfig) -> anyhow::Result<Self> {
        if let Some(secret) = config.jwt_secret.as_deref() {
            return Ok(Self::shared_secret(secret, config.jwt_audience.as_deref()));
        }
        let project_id = config.firebase_project_id.clone().ok_or_else(|| {
            anyhow!("Set AUTH_JWT_SECRET or FIREBASE_PROJECT_ID to verify bearer tokens")
        })?;
        Self::firebase(project_id)
    }

    pub async fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let claims = match self {
            TokenVerifier::SharedSecret { key, validation } => {
                decode::<TokenClaims>(token, key, validation)
                    .map_err(|e| ApiError::unauthorized(format!("Token validation failed: {}", e)))?
                    .claims
            }
            TokenVerifier::Firebase(jwks) => jwks.verify_token(token).await?,
        };
        if claims.sub.is_empty() {
            return Err(ApiError::unauthorized("Token has no subject"));
        }
        Ok(AuthUser::from(claims))
    }
}

/// Axum extractor for authenticated user.
#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|e| {
                    if e.is_missing() {
                        ApiError::unauthorized("Missing Authorization header")
                    } else {
                        ApiError::unauthorized("Invalid Authorization header format")
                    }
                })?;

        state.verifier.verify(bearer.token()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[tokio::test]
    async fn test_shared_secret_accepts_valid_token() {
        let verifier = TokenVerifier::shared_secret("s3cret", None);
        let user = verifier
            .verify(&token("s3cret", json!({ "sub": "u-1", "email": "a@b.c", "exp": exp() })))
            .await
            .unwrap();
        assert_eq!(user.uid, "u-1");
        assert_eq!(user.email.as_deref(), Some("a@b.c"));
        assert!(!user.email_verified);
    }

    #[tokio::test]
    async fn test_shared_secret_rejects_wrong_key_and_expired() {
        let verifier = TokenVerifier::shared_secret("s3cret", None);
        let forged = token("other", json!({ "sub": "u-1", "exp": exp() }));
        assert!(matches!(
            verifier.verify(&forged).await,
            Err(ApiError::Unauthorized(_))
        ));

        let expired = token("s3cret", json!({ "sub": "u-1", "exp": 1_000 }));
        assert!(matches!(
            verifier.verify(&expired).await,
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_audience_is_enforced_when_configured() {
        let verifier = TokenVerifier::shared_secret("s3cret", Some("reelpipe"));
        let wrong = token("s3cret", json!({ "sub": "u-1", "aud": "other", "exp": exp() }));
        assert!(verifier.verify(&wrong).await.is_err());

        let right = token("s3cret", json!({ "sub": "u-1", "aud": "reelpipe", "exp": exp() }));
        assert_eq!(verifier.verify(&right).await.unwrap().uid, "u-1");
    }

    #[test]
    fn test_from_config_requires_a_verifier() {
        let config = ApiConfig::default();
        assert!(TokenVerifier::from_config(&config).is_err());

        let config = ApiConfig {
            jwt_secret: Some("s3cret".into()),
            ..ApiConfig::default()
        };
        assert!(matches!(
            TokenVerifier::from_config(&config),
            Ok(TokenVerifier::SharedSecret { .. })
        ));
    }
}
