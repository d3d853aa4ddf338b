//! Structured logging for the job lifecycle.

use reel_models::{ProviderJobId, SessionId};
use tracing::{error, info, warn, Span};

/// Logger carrying the session, provider job and operation of one job.
#[derive(Debug, Clone)]
pub struct JobLogger {
    session_id: String,
    provider_job_id: String,
    operation: String,
}

impl JobLogger {
    pub fn new(session_id: &SessionId, provider_job_id: &ProviderJobId, operation: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            provider_job_id: provider_job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn provider_job_id(&self) -> &str {
        &self.provider_job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span for one unit of work on this job (e.g. a poll tick).
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            session_id = %self.session_id,
            provider_job_id = %self.provider_job_id,
            operation = %self.operation
        )
    }
}
