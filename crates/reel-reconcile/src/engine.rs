//! Reconciliation of provider observations into session records.
//!
//! Poll, webhook and manual observations all go through
//! [`Reconciler::apply_observation`]. Each application reads the current
//! record, merges the observation in memory and writes the whole record back
//! with a compare-and-set on its version; a lost race re-reads and merges
//! again. Clips are unioned by id with stored entries winning, and the job
//! status is written in the same record as the clips, so a reader never sees
//! `completed` without the clips that completed it.

use std::sync::Arc;
use std::time::Duration;

use reel_models::{Clip, JobStatus, ProcessingJob, ProviderJobId, SessionId, SessionRecord};
use reel_provider::{ProviderStatus, WebhookPayload};
use tracing::debug;

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::logging::JobLogger;
use crate::metrics::{record_cas_conflict, record_clips_persisted, record_observation};
use crate::normalize::normalize_clips;
use crate::store::JobStore;

/// Base delay between compare-and-set attempts, multiplied by the attempt.
const CAS_BACKOFF: Duration = Duration::from_millis(50);

/// How [`Reconciler::bind_job`] treats the session it binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindOptions {
    /// Create the session if it does not exist yet
    pub create: bool,
    /// Replace a job that has not reached a terminal state
    pub replace_active: bool,
}

impl BindOptions {
    /// A new submission; `abandon_previous` lets it replace a running job.
    pub fn submission(abandon_previous: bool) -> Self {
        Self {
            create: true,
            replace_active: abandon_previous,
        }
    }

    /// Operator recovery: the session must exist and its job is replaced.
    pub fn recovery() -> Self {
        Self {
            create: false,
            replace_active: true,
        }
    }
}

/// Where an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Poll,
    Webhook,
    Manual,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Poll => "poll",
            Channel::Webhook => "webhook",
            Channel::Manual => "manual",
        }
    }
}

/// What an observation did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The record changed and was written
    Applied,
    /// Nothing new; the record was left alone
    Duplicate,
    /// The session is no longer bound to this provider job
    Stale,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Duplicate => "duplicate",
            Disposition::Stale => "stale",
        }
    }
}

/// Result of applying one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub session_id: SessionId,
    pub disposition: Disposition,
    /// Job status after the observation, `None` if the session has no job
    pub job_status: Option<JobStatus>,
    pub clips_added: usize,
    pub total_clips: usize,
}

impl ApplyOutcome {
    pub fn is_terminal(&self) -> bool {
        self.job_status.map(|s| s.is_terminal()).unwrap_or(false)
    }

    /// Polling this job any further would be wasted.
    pub fn should_stop_polling(&self) -> bool {
        self.disposition == Disposition::Stale || self.is_terminal()
    }
}

/// Stored state of a session relative to one provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active(JobStatus),
    Terminal(JobStatus),
    /// Bound to a different provider job, or to none
    Superseded,
    Missing,
}

/// Merge one observation into `record` in place.
///
/// `clips` is the normalized clip list of a completed observation. Failed
/// never replaces a terminal state; completed with clips not yet recorded
/// appends them and may promote a failed job to completed.
pub fn merge_observation(
    record: &mut SessionRecord,
    provider_job_id: &ProviderJobId,
    observation: &ProviderStatus,
    clips: &[Clip],
) -> (Disposition, usize) {
    let status = match record.job.as_ref() {
        Some(job) if job.provider_job_id == *provider_job_id => job.status,
        _ => return (Disposition::Stale, 0),
    };

    match observation {
        ProviderStatus::Processing => {
            if status != JobStatus::Submitted {
                return (Disposition::Duplicate, 0);
            }
            if let Some(job) = record.job.as_mut() {
                job.status = JobStatus::Processing;
            }
            (Disposition::Applied, 0)
        }
        ProviderStatus::Completed { .. } => {
            let new_clips: Vec<Clip> = clips
                .iter()
                .filter(|c| !record.contains_clip(&c.id))
                .cloned()
                .collect();
            let added = new_clips.len();

            if status.is_terminal() && added == 0 {
                return (Disposition::Duplicate, 0);
            }

            record.clips.extend(new_clips);
            if let Some(job) = record.job.as_mut() {
                if job.status != JobStatus::Completed {
                    job.complete();
                }
            }
            (Disposition::Applied, added)
        }
        ProviderStatus::Failed { message } => {
            if status.is_terminal() {
                return (Disposition::Duplicate, 0);
            }
            if let Some(job) = record.job.as_mut() {
                job.fail(message.clone());
            }
            (Disposition::Applied, 0)
        }
    }
}

/// The reconciliation engine.
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Load a session or fail with `SessionNotFound`.
    pub async fn load(&self, session_id: &SessionId) -> ReconcileResult<SessionRecord> {
        self.store
            .load(session_id)
            .await?
            .ok_or_else(|| ReconcileError::session_not_found(session_id.as_str()))
    }

    /// Where the session stands with respect to `provider_job_id`.
    pub async fn job_state(
        &self,
        session_id: &SessionId,
        provider_job_id: &ProviderJobId,
    ) -> ReconcileResult<JobState> {
        let Some(record) = self.store.load(session_id).await? else {
            return Ok(JobState::Missing);
        };
        Ok(match record.job {
            Some(job) if job.provider_job_id == *provider_job_id => {
                if job.status.is_terminal() {
                    JobState::Terminal(job.status)
                } else {
                    JobState::Active(job.status)
                }
            }
            _ => JobState::Superseded,
        })
    }

    /// Apply one provider observation to a session.
    pub async fn apply_observation(
        &self,
        session_id: &SessionId,
        provider_job_id: &ProviderJobId,
        observation: &ProviderStatus,
        channel: Channel,
    ) -> ReconcileResult<ApplyOutcome> {
        // Normalized once so synthesized scores stay put across CAS retries.
        let clips = match observation {
            ProviderStatus::Completed { clips } => normalize_clips(provider_job_id, clips),
            _ => Vec::new(),
        };

        let (record, (disposition, added)) = self
            .update(session_id, None, |record| {
                let (disposition, added) =
                    merge_observation(record, provider_job_id, observation, &clips);
                Ok((disposition == Disposition::Applied, (disposition, added)))
            })
            .await?;

        record_observation(channel.as_str(), disposition.as_str());
        if added > 0 {
            record_clips_persisted(added);
        }

        let outcome = ApplyOutcome {
            session_id: session_id.clone(),
            disposition,
            job_status: record.job.as_ref().map(|j| j.status),
            clips_added: added,
            total_clips: record.clips.len(),
        };

        let logger = JobLogger::new(session_id, provider_job_id, channel.as_str());
        match (disposition, observation) {
            (Disposition::Applied, ProviderStatus::Completed { .. }) => logger.log_completion(
                &format!("{} new clips, {} total", added, outcome.total_clips),
            ),
            (Disposition::Applied, ProviderStatus::Failed { message }) => {
                logger.log_error(&format!("provider reported failure: {}", message))
            }
            (Disposition::Applied, ProviderStatus::Processing) => {
                logger.log_progress("provider is processing")
            }
            (Disposition::Stale, _) => {
                logger.log_warning("observation for a job the session is no longer bound to")
            }
            (Disposition::Duplicate, _) => {
                debug!(session_id = %session_id, provider_job_id = %provider_job_id,
                    channel = channel.as_str(), status = observation.label(),
                    "Duplicate observation ignored");
            }
        }

        Ok(outcome)
    }

    /// Apply a webhook to the session bound to its provider job.
    ///
    /// Fails with `UnknownProviderJob` when no session is bound. Non-terminal
    /// notices are acknowledged without a write and yield `None`.
    pub async fn apply_webhook(
        &self,
        payload: &WebhookPayload,
    ) -> ReconcileResult<Option<ApplyOutcome>> {
        let provider_job_id = ProviderJobId::from(payload.project_id.as_str());
        let record = self
            .store
            .find_by_provider_job(&provider_job_id)
            .await?
            .ok_or_else(|| ReconcileError::UnknownProviderJob(payload.project_id.clone()))?;

        let Some(observation) = payload.observation() else {
            debug!(provider_job_id = %provider_job_id, "Non-terminal webhook acknowledged");
            return Ok(None);
        };

        self.apply_observation(
            &record.session_id,
            &provider_job_id,
            &observation,
            Channel::Webhook,
        )
        .await
        .map(Some)
    }

    /// Bind `provider_job_id` as the session's job.
    ///
    /// With `options.create` a missing session is created for `owner_id`;
    /// otherwise it is `SessionNotFound`. Sessions owned by someone else are
    /// reported as not found. Re-binding the id already bound keeps the job
    /// as is. A different job that is still running is only replaced with
    /// `options.replace_active`; the check runs on the record being written,
    /// so concurrent binds cannot both replace it.
    pub async fn bind_job(
        &self,
        session_id: &SessionId,
        owner_id: &str,
        provider_job_id: &ProviderJobId,
        options: BindOptions,
    ) -> ReconcileResult<ProcessingJob> {
        let create_owner = options.create.then_some(owner_id);
        let (_, job) = self
            .update(session_id, create_owner, |record| {
                if record.owner_id != owner_id {
                    return Err(ReconcileError::session_not_found(session_id.as_str()));
                }
                if let Some(job) = record
                    .job
                    .as_ref()
                    .filter(|j| j.provider_job_id == *provider_job_id)
                {
                    return Ok((false, job.clone()));
                }
                if record.has_active_job() && !options.replace_active {
                    return Err(ReconcileError::JobActive(session_id.to_string()));
                }
                let job = ProcessingJob::submitted(session_id.clone(), provider_job_id.clone());
                record.job = Some(job.clone());
                Ok((true, job))
            })
            .await?;
        Ok(job)
    }

    /// Read, mutate and compare-and-set a record, re-reading on lost races.
    ///
    /// `mutate` returns whether it changed the record plus a value for the
    /// caller; unchanged records are not written.
    async fn update<T, F>(
        &self,
        session_id: &SessionId,
        create_owner: Option<&str>,
        mut mutate: F,
    ) -> ReconcileResult<(SessionRecord, T)>
    where
        F: FnMut(&mut SessionRecord) -> ReconcileResult<(bool, T)>,
    {
        let max_attempts = self.config.persist_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut record = match (self.store.load(session_id).await?, create_owner) {
                (Some(record), _) => record,
                (None, Some(owner)) => SessionRecord::new(session_id.clone(), owner),
                (None, None) => return Err(ReconcileError::session_not_found(session_id.as_str())),
            };

            let (changed, value) = mutate(&mut record)?;
            if !changed {
                return Ok((record, value));
            }

            match self.store.compare_and_set(&record).await {
                Ok(version) => {
                    record.version = Some(version);
                    return Ok((record, value));
                }
                Err(ReconcileError::VersionConflict(msg)) => {
                    record_cas_conflict();
                    debug!(
                        session_id = %session_id,
                        attempt,
                        "Session write lost a race, re-reading: {}", msg
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(CAS_BACKOFF * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ReconcileError::ConflictExhausted(max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bound_record(session: &str, job: &str) -> SessionRecord {
        let mut record = SessionRecord::new(SessionId::from(session), "owner-1");
        record.job = Some(ProcessingJob::submitted(
            record.session_id.clone(),
            ProviderJobId::from(job),
        ));
        record
    }

    fn completed(clips: serde_json::Value) -> ProviderStatus {
        ProviderStatus::Completed {
            clips: clips.as_array().cloned().unwrap_or_default(),
        }
    }

    fn engine(store: Arc<MemoryJobStore>) -> Reconciler {
        Reconciler::new(store, ReconcileConfig::default())
    }

    #[tokio::test]
    async fn test_processing_then_completed() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let (sid, pid) = (SessionId::from("s-1"), ProviderJobId::from("p-1"));

        let outcome = engine
            .apply_observation(&sid, &pid, &ProviderStatus::Processing, Channel::Poll)
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Applied);
        assert_eq!(outcome.job_status, Some(JobStatus::Processing));

        let again = engine
            .apply_observation(&sid, &pid, &ProviderStatus::Processing, Channel::Poll)
            .await
            .unwrap();
        assert_eq!(again.disposition, Disposition::Duplicate);

        let done = engine
            .apply_observation(
                &sid,
                &pid,
                &completed(json!([{ "id": "a", "score": 7 }, { "id": "b", "score": 55 }])),
                Channel::Poll,
            )
            .await
            .unwrap();
        assert_eq!(done.job_status, Some(JobStatus::Completed));
        assert_eq!(done.clips_added, 2);

        let stored = store.get(&sid).unwrap();
        assert_eq!(stored.clips[0].virality_score, 88);
        assert_eq!(stored.clips[1].virality_score, 55);
        assert!(stored.job.unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn test_same_webhook_twice_is_idempotent() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());

        let payload: WebhookPayload = serde_json::from_value(json!({
            "projectId": "p-1",
            "status": "completed",
            "clips": [{ "videoUrl": "https://cdn.test/1.mp4" }, { "videoUrl": "https://cdn.test/2.mp4" }]
        }))
        .unwrap();

        let first = engine.apply_webhook(&payload).await.unwrap().unwrap();
        let after_first = store.get(&SessionId::from("s-1")).unwrap();
        let second = engine.apply_webhook(&payload).await.unwrap().unwrap();
        let after_second = store.get(&SessionId::from("s-1")).unwrap();

        assert_eq!(first.disposition, Disposition::Applied);
        assert_eq!(second.disposition, Disposition::Duplicate);
        assert_eq!(after_first.clips, after_second.clips);
        assert_eq!(after_first.version, after_second.version);
    }

    #[tokio::test]
    async fn test_poll_and_webhook_converge_to_union() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let (sid, pid) = (SessionId::from("s-1"), ProviderJobId::from("p-1"));

        engine
            .apply_observation(
                &sid,
                &pid,
                &completed(json!([{ "id": "a" }, { "id": "b" }])),
                Channel::Webhook,
            )
            .await
            .unwrap();
        let late = engine
            .apply_observation(
                &sid,
                &pid,
                &completed(json!([{ "id": "b" }, { "id": "c" }])),
                Channel::Poll,
            )
            .await
            .unwrap();

        assert_eq!(late.clips_added, 1);
        let stored = store.get(&sid).unwrap();
        let ids: Vec<_> = stored.clips.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(stored.job.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_never_demotes_completed() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let (sid, pid) = (SessionId::from("s-1"), ProviderJobId::from("p-1"));

        engine
            .apply_observation(&sid, &pid, &completed(json!([{ "id": "a" }])), Channel::Poll)
            .await
            .unwrap();
        let outcome = engine
            .apply_observation(
                &sid,
                &pid,
                &ProviderStatus::Failed {
                    message: "late failure".into(),
                },
                Channel::Webhook,
            )
            .await
            .unwrap();

        assert_eq!(outcome.disposition, Disposition::Duplicate);
        assert_eq!(outcome.job_status, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_new_clips_promote_failed_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let (sid, pid) = (SessionId::from("s-1"), ProviderJobId::from("p-1"));

        engine
            .apply_observation(
                &sid,
                &pid,
                &ProviderStatus::Failed {
                    message: "timed out".into(),
                },
                Channel::Poll,
            )
            .await
            .unwrap();
        let empty = engine
            .apply_observation(&sid, &pid, &completed(json!([])), Channel::Webhook)
            .await
            .unwrap();
        assert_eq!(empty.job_status, Some(JobStatus::Failed));

        let outcome = engine
            .apply_observation(&sid, &pid, &completed(json!([{ "id": "a" }])), Channel::Webhook)
            .await
            .unwrap();
        assert_eq!(outcome.job_status, Some(JobStatus::Completed));
        assert!(store.get(&sid).unwrap().job.unwrap().error_message.is_none());
    }

    #[tokio::test]
    async fn test_observation_for_rebound_job_is_stale() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-new"));
        let engine = engine(store.clone());

        let outcome = engine
            .apply_observation(
                &SessionId::from("s-1"),
                &ProviderJobId::from("p-old"),
                &completed(json!([{ "id": "a" }])),
                Channel::Poll,
            )
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Stale);
        assert!(outcome.should_stop_polling());
        assert!(store.get(&SessionId::from("s-1")).unwrap().clips.is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_webhook_is_not_found_without_writes() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let before = store.get(&SessionId::from("s-1"));

        let payload: WebhookPayload =
            serde_json::from_value(json!({ "projectId": "nope", "status": "completed" })).unwrap();
        let err = engine.apply_webhook(&payload).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get(&SessionId::from("s-1")), before);
    }

    #[tokio::test]
    async fn test_bind_job_checks_owner() {
        let store = Arc::new(MemoryJobStore::new());
        let engine = engine(store.clone());
        let sid = SessionId::from("s-9");

        let job = engine
            .bind_job(&sid, "owner-1", &ProviderJobId::from("p-1"), BindOptions::submission(false))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Submitted);

        let err = engine
            .bind_job(&sid, "intruder", &ProviderJobId::from("p-2"), BindOptions::recovery())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let missing = engine
            .bind_job(
                &SessionId::from("nope"),
                "owner-1",
                &ProviderJobId::from("p"),
                BindOptions::recovery(),
            )
            .await
            .unwrap_err();
        assert!(matches!(missing, ReconcileError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_bind_refuses_to_replace_running_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.insert(bound_record("s-1", "p-1"));
        let engine = engine(store.clone());
        let sid = SessionId::from("s-1");

        let err = engine
            .bind_job(&sid, "owner-1", &ProviderJobId::from("p-2"), BindOptions::submission(false))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::JobActive(_)));
        assert_eq!(
            store.get(&sid).unwrap().job.unwrap().provider_job_id,
            ProviderJobId::from("p-1")
        );

        // Re-binding the running job itself is not a replacement.
        engine
            .bind_job(&sid, "owner-1", &ProviderJobId::from("p-1"), BindOptions::submission(false))
            .await
            .unwrap();

        let job = engine
            .bind_job(&sid, "owner-1", &ProviderJobId::from("p-2"), BindOptions::submission(true))
            .await
            .unwrap();
        assert_eq!(job.provider_job_id, ProviderJobId::from("p-2"));
    }

    /// Store whose first writes lose a race against a concurrent writer.
    struct RacingStore {
        inner: MemoryJobStore,
        conflicts_left: AtomicU32,
    }

    #[async_trait]
    impl JobStore for RacingStore {
        async fn load(&self, id: &SessionId) -> ReconcileResult<Option<SessionRecord>> {
            self.inner.load(id).await
        }

        async fn find_by_provider_job(
            &self,
            id: &ProviderJobId,
        ) -> ReconcileResult<Option<SessionRecord>> {
            self.inner.find_by_provider_job(id).await
        }

        async fn compare_and_set(&self, record: &SessionRecord) -> ReconcileResult<String> {
            if self.conflicts_left.load(Ordering::SeqCst) > 0 {
                self.conflicts_left.fetch_sub(1, Ordering::SeqCst);
                // The other channel lands one clip first.
                let mut theirs = self.inner.get(&record.session_id).unwrap();
                theirs.clips.push(normalize_clips(
                    &ProviderJobId::from("p-1"),
                    &[json!({ "id": "from-webhook" })],
                )[0]
                .clone());
                self.inner.insert(theirs);
            }
            self.inner.compare_and_set(record).await
        }
    }

    #[tokio::test]
    async fn test_lost_race_rereads_and_keeps_both_clips() {
        let store = Arc::new(RacingStore {
            inner: MemoryJobStore::new(),
            conflicts_left: AtomicU32::new(1),
        });
        store.inner.insert(bound_record("s-1", "p-1"));
        let engine = Reconciler::new(store.clone(), ReconcileConfig::default());

        engine
            .apply_observation(
                &SessionId::from("s-1"),
                &ProviderJobId::from("p-1"),
                &completed(json!([{ "id": "from-poll" }])),
                Channel::Poll,
            )
            .await
            .unwrap();

        let stored = store.inner.get(&SessionId::from("s-1")).unwrap();
        let ids: Vec<_> = stored.clips.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["from-webhook", "from-poll"]);
    }

    #[tokio::test]
    async fn test_conflicts_exhaust_attempts() {
        let store = Arc::new(RacingStore {
            inner: MemoryJobStore::new(),
            conflicts_left: AtomicU32::new(u32::MAX),
        });
        store.inner.insert(bound_record("s-1", "p-1"));
        let config = ReconcileConfig {
            persist_max_attempts: 2,
            ..ReconcileConfig::default()
        };
        let engine = Reconciler::new(store, config);

        let err = engine
            .apply_observation(
                &SessionId::from("s-1"),
                &ProviderJobId::from("p-1"),
                &completed(json!([{ "id": "x" }])),
                Channel::Poll,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ConflictExhausted(2)));
    }
}
