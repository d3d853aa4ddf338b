//! Application state.

use std::sync::Arc;

use reel_reconcile::JobService;
use reel_storage::{PartPlanner, R2Client};

use crate::auth::TokenVerifier;
use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub planner: Arc<PartPlanner>,
    pub jobs: Arc<JobService>,
    pub verifier: Arc<TokenVerifier>,
    /// Bucket checked by the readiness endpoint, absent when signing is faked
    pub storage: Option<Arc<R2Client>>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        planner: PartPlanner,
        jobs: Arc<JobService>,
        verifier: TokenVerifier,
    ) -> Self {
        Self {
            config,
            planner: Arc::new(planner),
            jobs,
            verifier: Arc::new(verifier),
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<R2Client>) -> Self {
        self.storage = Some(storage);
        self
    }
}
