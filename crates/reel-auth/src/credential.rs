//! Short-lived credential held by the guard.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Bearer credential plus the long-lived secret used to renew it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// Credential valid for `ttl` from now.
    pub fn expiring_in(access_token: impl Into<String>, refresh_token: Option<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Self::new(access_token, refresh_token, Utc::now() + ttl)
    }

    /// True once the credential is within `buffer` of its expiry.
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + buffer >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_refresh_inside_buffer() {
        let buffer = Duration::from_secs(300);
        let soon = Credential::expiring_in("a", None, Duration::from_secs(120));
        let later = Credential::expiring_in("a", None, Duration::from_secs(3600));
        assert!(soon.needs_refresh(buffer));
        assert!(!soon.is_expired());
        assert!(!later.needs_refresh(buffer));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let cred = Credential::expiring_in("secret-access", Some("secret-refresh".into()), Duration::from_secs(60));
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("secret"));
    }
}
