//! Job lifecycle entry points used by the API.

use std::sync::Arc;

use reel_models::{ProcessingJob, ProviderJobId, SessionId, SessionRecord};
use reel_provider::{ClipProvider, SubmitRequest, WebhookPayload};
use tracing::info;

use crate::engine::{ApplyOutcome, BindOptions, Channel, Reconciler};
use crate::error::{ReconcileError, ReconcileResult};
use crate::logging::JobLogger;
use crate::metrics::record_submission;
use crate::poller::{poll_once, PollScheduler};

/// Parameters of a job submission.
#[derive(Debug, Clone)]
pub struct SubmitJob {
    pub session_id: SessionId,
    pub owner_id: String,
    /// Readable URL of the uploaded source video
    pub source_url: String,
    pub language: String,
    pub preferred_durations: Vec<u32>,
    pub max_clips: u32,
    pub min_virality_score: u8,
    /// Replace a job that is still running instead of refusing
    pub abandon_previous: bool,
}

/// A job accepted by the provider and bound to its session.
#[derive(Debug, Clone)]
pub struct SubmittedJob {
    pub job: ProcessingJob,
    pub estimated_completion_minutes: Option<u32>,
}

/// Submission, webhook, manual reconciliation and status reads over one
/// engine, provider and poll scheduler.
pub struct JobService {
    engine: Arc<Reconciler>,
    provider: Arc<dyn ClipProvider>,
    scheduler: PollScheduler,
}

impl JobService {
    pub fn new(engine: Arc<Reconciler>, provider: Arc<dyn ClipProvider>) -> Self {
        let scheduler = PollScheduler::new(engine.clone(), provider.clone());
        Self {
            engine,
            provider,
            scheduler,
        }
    }

    pub fn engine(&self) -> &Arc<Reconciler> {
        &self.engine
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    /// Submit a job to the provider, bind it to the session and start polling.
    ///
    /// Refuses with `JobActive` while the session's current job is running,
    /// unless `abandon_previous` is set. The early check spares a provider
    /// call; the binding write checks again, so of two racing submissions
    /// only one is bound. If the provider accepts the job but
    /// the binding cannot be written, the job is orphaned and the error says
    /// so; it can be recovered through manual reconciliation.
    pub async fn submit_job(&self, request: SubmitJob) -> ReconcileResult<SubmittedJob> {
        if request.source_url.trim().is_empty() {
            return Err(ReconcileError::invalid_argument("sourceUrl is required"));
        }
        if request.max_clips == 0 {
            return Err(ReconcileError::invalid_argument("maxClips must be at least 1"));
        }

        if let Some(existing) = self.engine.store().load(&request.session_id).await? {
            if existing.owner_id != request.owner_id {
                return Err(ReconcileError::session_not_found(request.session_id.as_str()));
            }
            if existing.has_active_job() && !request.abandon_previous {
                return Err(ReconcileError::JobActive(request.session_id.to_string()));
            }
        }

        let submit = SubmitRequest {
            source_url: request.source_url.clone(),
            language: request.language.clone(),
            preferred_durations: request.preferred_durations.clone(),
            max_clips: request.max_clips,
            min_virality_score: request.min_virality_score,
            webhook_url: self.engine.config().webhook_url.clone(),
        };
        let response = match self.provider.submit(&submit).await {
            Ok(response) => {
                record_submission("accepted");
                response
            }
            Err(e) => {
                record_submission("rejected");
                return Err(e.into());
            }
        };

        let provider_job_id = ProviderJobId::from(response.provider_job_id);
        let logger = JobLogger::new(&request.session_id, &provider_job_id, "submit");

        let job = match self
            .engine
            .bind_job(
                &request.session_id,
                &request.owner_id,
                &provider_job_id,
                BindOptions::submission(request.abandon_previous),
            )
            .await
        {
            Ok(job) => job,
            Err(e @ ReconcileError::JobActive(_)) => {
                logger.log_warning(
                    "another submission bound a job first; provider job left unbound",
                );
                return Err(e);
            }
            Err(e) => {
                logger.log_error(&format!(
                    "provider accepted the job but it could not be recorded, reconcile manually: {}",
                    e
                ));
                return Err(e);
            }
        };

        logger.log_start("submitted to provider");
        self.scheduler
            .start(request.session_id.clone(), provider_job_id);

        Ok(SubmittedJob {
            job,
            estimated_completion_minutes: response.estimated_completion_minutes,
        })
    }

    /// Apply an inbound webhook and stop polling once the job is settled.
    pub async fn handle_webhook(
        &self,
        payload: &WebhookPayload,
    ) -> ReconcileResult<Option<ApplyOutcome>> {
        let outcome = self.engine.apply_webhook(payload).await?;
        if let Some(outcome) = outcome.as_ref().filter(|o| o.should_stop_polling()) {
            self.scheduler.stop(&outcome.session_id);
        }
        Ok(outcome)
    }

    /// Re-bind an operator-supplied provider job to a session and re-query it.
    ///
    /// Uses the same query-and-apply step as the poll loop. A job that is
    /// still running afterwards (or whose query failed) is handed to the
    /// scheduler.
    pub async fn manual_reconcile(
        &self,
        session_id: &SessionId,
        provider_job_id: &ProviderJobId,
        caller_id: &str,
    ) -> ReconcileResult<ApplyOutcome> {
        if provider_job_id.as_str().trim().is_empty() {
            return Err(ReconcileError::invalid_argument("providerJobId is required"));
        }

        self.engine
            .bind_job(session_id, caller_id, provider_job_id, BindOptions::recovery())
            .await?;
        info!(session_id = %session_id, provider_job_id = %provider_job_id, "Manual reconciliation");

        let result = poll_once(
            &self.engine,
            self.provider.as_ref(),
            session_id,
            provider_job_id,
            Channel::Manual,
        )
        .await;

        match &result {
            Ok(outcome) if outcome.should_stop_polling() => {
                self.scheduler.stop(session_id);
            }
            _ => self
                .scheduler
                .start(session_id.clone(), provider_job_id.clone()),
        }
        result
    }

    /// The caller's session record. Foreign sessions are not found.
    pub async fn get_job(
        &self,
        session_id: &SessionId,
        caller_id: &str,
    ) -> ReconcileResult<SessionRecord> {
        let record = self.engine.load(session_id).await?;
        if record.owner_id != caller_id {
            return Err(ReconcileError::session_not_found(session_id.as_str()));
        }
        Ok(record)
    }

    /// Stop every poll loop.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
