//! Authentication guard.
//!
//! Wraps every call that touches the backing store so callers never reason
//! about token expiry:
//! - proactive refresh when the credential is inside the refresh buffer
//! - one refresh-and-retry when the operation fails with an auth error
//! - coalesced refresh: concurrent callers share a single network refresh
//! - forced sign-out only when the refresh secret itself is rejected

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::credential::Credential;
use crate::error::{AuthClassify, AuthError, AuthResult};
use crate::metrics::{record_refresh, record_retry};
use crate::provider::CredentialProvider;

/// Options for a guarded call.
#[derive(Debug, Clone, Copy)]
pub struct GuardOptions {
    /// Refresh and retry when the operation fails with an auth error.
    pub retry_on_failure: bool,
    /// Upper bound on retries. The guard retries at most once, and not at
    /// all when this is zero.
    pub max_retries: u32,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            retry_on_failure: true,
            max_retries: 2,
        }
    }
}

/// Invoked when the session cannot be recovered without a new sign-in.
pub trait SignOutHandler: Send + Sync {
    fn sign_out(&self, login_url: Option<&str>, reason: &AuthError);
}

/// Default handler: log and let the caller surface the error.
#[derive(Debug, Default)]
pub struct LogSignOut;

impl SignOutHandler for LogSignOut {
    fn sign_out(&self, login_url: Option<&str>, reason: &AuthError) {
        warn!(
            login_url = login_url.unwrap_or("-"),
            "Session signed out, re-authentication required: {}", reason
        );
    }
}

/// Why a refresh is being requested.
#[derive(Debug, Clone, Copy)]
enum RefreshReason<'a> {
    /// Credential missing or inside the refresh buffer.
    Proactive,
    /// The backing store rejected this token.
    Rejected(&'a str),
}

/// Outcome of the last network refresh, shared with callers that queued
/// behind it.
#[derive(Default)]
struct RefreshSlot {
    attempts: u64,
    last: Option<AuthResult<Credential>>,
}

/// Guard holding the current credential.
pub struct AuthGuard {
    provider: Arc<dyn CredentialProvider>,
    sign_out: Arc<dyn SignOutHandler>,
    config: AuthConfig,
    credential: RwLock<Option<Credential>>,
    refresh: Mutex<RefreshSlot>,
    refresh_attempts: AtomicU64,
}

impl AuthGuard {
    pub fn new(provider: Arc<dyn CredentialProvider>, config: AuthConfig) -> Self {
        Self {
            provider,
            sign_out: Arc::new(LogSignOut),
            config,
            credential: RwLock::new(None),
            refresh: Mutex::new(RefreshSlot::default()),
            refresh_attempts: AtomicU64::new(0),
        }
    }

    pub fn with_sign_out(mut self, handler: Arc<dyn SignOutHandler>) -> Self {
        self.sign_out = handler;
        self
    }

    /// Seed the guard with an existing credential (e.g. after sign-in).
    pub fn with_credential(self, credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
            ..self
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Snapshot of the current credential.
    pub async fn current(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    /// Replace the held credential.
    pub async fn set_credential(&self, credential: Credential) {
        *self.credential.write().await = Some(credential);
    }

    /// True if the held credential is missing or inside the refresh buffer.
    pub async fn needs_refresh(&self) -> bool {
        match self.credential.read().await.as_ref() {
            Some(cred) => cred.needs_refresh(self.config.refresh_buffer),
            None => true,
        }
    }

    /// Return a token that is outside the refresh buffer, refreshing first
    /// when needed.
    pub async fn access_token(&self) -> AuthResult<String> {
        // Fast path
        {
            let cred = self.credential.read().await;
            if let Some(cred) = cred.as_ref() {
                if !cred.needs_refresh(self.config.refresh_buffer) {
                    return Ok(cred.access_token.clone());
                }
            }
        }

        match self.refresh_coalesced(RefreshReason::Proactive).await {
            Ok(cred) => Ok(cred.access_token),
            Err(e) if e.requires_sign_in() => {
                self.force_sign_out(&e).await;
                Err(e)
            }
            Err(e) => {
                // Fall back to a token that is still technically usable.
                let cred = self.credential.read().await;
                match cred.as_ref() {
                    Some(c) if !c.is_expired() => {
                        warn!("Credential refresh failed, using existing token: {}", e);
                        Ok(c.access_token.clone())
                    }
                    _ => Err(e),
                }
            }
        }
    }

    /// Run `operation` with a valid bearer token.
    ///
    /// On an auth-classified failure the credential is refreshed and the
    /// whole operation is retried once with retries disabled. If that refresh
    /// fails transiently, the operation's original error is returned
    /// unchanged; if the refresh secret is dead, the session is signed out
    /// and the auth error is returned.
    pub async fn with_valid_credential<T, E, F, Fut>(
        &self,
        options: GuardOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: AuthClassify + From<AuthError>,
    {
        let token = self.access_token().await.map_err(E::from)?;

        let err = match operation(token.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_auth_error() || !options.retry_on_failure || options.max_retries == 0 {
            return Err(err);
        }

        debug!("Guarded operation rejected credential, refreshing: {}", err);
        let fresh = match self.refresh_coalesced(RefreshReason::Rejected(&token)).await {
            Ok(cred) => cred,
            Err(refresh_err) if refresh_err.requires_sign_in() => {
                self.force_sign_out(&refresh_err).await;
                return Err(E::from(refresh_err));
            }
            Err(refresh_err) => {
                warn!("Credential refresh failed after auth error: {}", refresh_err);
                return Err(err);
            }
        };

        // Single retry; its failure is returned as-is.
        record_retry();
        operation(fresh.access_token).await
    }

    /// Refresh now unless the credential is still outside the buffer.
    pub async fn refresh_if_needed(&self) -> AuthResult<()> {
        if !self.needs_refresh().await {
            return Ok(());
        }
        match self.refresh_coalesced(RefreshReason::Proactive).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.requires_sign_in() {
                    self.force_sign_out(&e).await;
                }
                Err(e)
            }
        }
    }

    /// Single-flight refresh.
    ///
    /// Callers that queued behind an in-flight refresh receive its outcome
    /// instead of issuing another network call.
    async fn refresh_coalesced(&self, reason: RefreshReason<'_>) -> AuthResult<Credential> {
        let observed = self.refresh_attempts.load(Ordering::Acquire);
        let mut slot = self.refresh.lock().await;

        if slot.attempts != observed {
            if let Some(last) = slot.last.clone() {
                return last;
            }
        }

        // Double-check: the credential may already be fresh.
        {
            let cred = self.credential.read().await;
            if let Some(cred) = cred.as_ref() {
                let still_good = match reason {
                    RefreshReason::Proactive => !cred.needs_refresh(self.config.refresh_buffer),
                    RefreshReason::Rejected(token) => {
                        cred.access_token != token && !cred.is_expired()
                    }
                };
                if still_good {
                    return Ok(cred.clone());
                }
            }
        }

        let current = self.credential.read().await.clone();
        let outcome = self.provider.refresh(current.as_ref()).await;

        match &outcome {
            Ok(cred) => {
                *self.credential.write().await = Some(cred.clone());
                info!(expires_at = %cred.expires_at, "Credential refreshed");
                record_refresh("success");
            }
            Err(e) => {
                warn!("Credential refresh failed: {}", e);
                record_refresh(if e.requires_sign_in() { "invalid" } else { "error" });
            }
        }

        slot.attempts += 1;
        slot.last = Some(outcome.clone());
        self.refresh_attempts.store(slot.attempts, Ordering::Release);
        outcome
    }

    /// Tear down client-held session state.
    async fn force_sign_out(&self, reason: &AuthError) {
        *self.credential.write().await = None;
        self.sign_out
            .sign_out(self.config.login_url.as_deref(), reason);
    }
}
