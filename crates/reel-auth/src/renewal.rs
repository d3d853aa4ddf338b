//! Background credential renewal.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::guard::AuthGuard;

/// Owned handle to the renewal task. Dropping it stops the task.
pub struct RenewalHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewalHandle {
    /// Stop the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a task that refreshes the guard's credential whenever it is inside
/// the refresh buffer, independent of in-flight operations.
///
/// The task stops when cancelled or once the session has been signed out.
pub fn spawn_renewal(guard: Arc<AuthGuard>, cancel: CancellationToken) -> RenewalHandle {
    let interval = guard.config().renewal_interval;
    let child = cancel.child_token();
    let token = child.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Credential renewal stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match guard.refresh_if_needed().await {
                        Ok(()) => {}
                        Err(e) if e.requires_sign_in() => {
                            warn!("Credential renewal ended: {}", e);
                            break;
                        }
                        Err(e) => warn!("Credential renewal failed, will retry: {}", e),
                    }
                }
            }
        }
    });

    RenewalHandle {
        cancel: child,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthConfig, AuthResult, Credential, CredentialProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl CredentialProvider for Counting {
        async fn refresh(&self, _current: Option<&Credential>) -> AuthResult<Credential> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            // Always lands inside the buffer so every tick refreshes.
            Ok(Credential::expiring_in(format!("t{}", n), Some("rt".into()), Duration::from_secs(60)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_refreshes_on_cadence_and_stops() {
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let guard = Arc::new(AuthGuard::new(provider.clone(), AuthConfig::default()));
        let cancel = CancellationToken::new();

        let handle = spawn_renewal(guard.clone(), cancel.clone());

        // First tick fires immediately, then every 60s.
        tokio::time::sleep(Duration::from_secs(125)).await;
        let seen = provider.0.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        cancel.cancel();
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(provider.0.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_skips_fresh_credential() {
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let fresh = Credential::expiring_in("t0", Some("rt".into()), Duration::from_secs(3600));
        let guard = Arc::new(AuthGuard::new(provider.clone(), AuthConfig::default()).with_credential(fresh));

        let handle = spawn_renewal(guard, CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(provider.0.load(Ordering::SeqCst), 0);
        drop(handle);
    }
}
