//! Authentication guard for the ReelPipe pipeline.
//!
//! Keeps a short-lived bearer credential valid across long-running upload and
//! reconciliation work:
//! - [`AuthGuard::with_valid_credential`] wraps a call with proactive refresh
//!   and a single refresh-and-retry on auth failures
//! - concurrent refreshes are coalesced into one network call
//! - [`spawn_renewal`] refreshes in the background on a fixed cadence
//! - [`CredentialProvider`] bindings for Firebase user sessions and GCP
//!   service accounts

pub mod config;
pub mod credential;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod provider;
pub mod renewal;

pub use config::AuthConfig;
pub use credential::Credential;
pub use error::{is_auth_message, is_auth_status, AuthClassify, AuthError, AuthResult};
pub use guard::{AuthGuard, GuardOptions, LogSignOut, SignOutHandler};
pub use provider::{
    CredentialProvider, FirebaseRefreshProvider, ServiceAccountProvider, FIRESTORE_SCOPE,
};
pub use renewal::{spawn_renewal, RenewalHandle};
