//! Provider polling.
//!
//! One loop per active job, owned by the [`PollScheduler`] that started it.
//! Each tick awaits its provider query before the next tick is taken, so a
//! slow provider never has more than one request in flight per job; missed
//! ticks are skipped rather than bursted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use reel_models::{JobStatus, ProviderJobId, SessionId};
use reel_provider::{ClipProvider, ProviderError, ProviderStatus};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::engine::{ApplyOutcome, Channel, Disposition, JobState, Reconciler};
use crate::error::ReconcileResult;
use crate::logging::JobLogger;
use crate::metrics::set_active_pollers;

/// Why a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// The job reached a terminal state, through any channel
    Terminal(JobStatus),
    /// The session was re-bound to another provider job
    Superseded,
    /// The session record disappeared
    SessionGone,
    /// The job exceeded its lifetime and was failed
    TimedOut,
    Cancelled,
}

/// Query the provider once and apply the answer.
///
/// Shared by the poll loop and manual reconciliation.
pub async fn poll_once(
    engine: &Reconciler,
    provider: &dyn ClipProvider,
    session_id: &SessionId,
    provider_job_id: &ProviderJobId,
    channel: Channel,
) -> ReconcileResult<ApplyOutcome> {
    let request_timeout = engine.config().poll_request_timeout;
    let status = timeout(request_timeout, provider.query(provider_job_id))
        .await
        .map_err(|_| ProviderError::Timeout(request_timeout.as_secs()))??;

    engine
        .apply_observation(session_id, provider_job_id, &status, channel)
        .await
}

/// Poll until the job is terminal, superseded, timed out or cancelled.
pub async fn run_poll_loop(
    engine: Arc<Reconciler>,
    provider: Arc<dyn ClipProvider>,
    session_id: SessionId,
    provider_job_id: ProviderJobId,
    cancel: CancellationToken,
) -> PollExit {
    let config = engine.config().clone();
    let logger = JobLogger::new(&session_id, &provider_job_id, "poll");
    logger.log_start(&format!("polling every {:?}", config.poll_interval));

    let started = Instant::now();
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return PollExit::Cancelled,
            _ = ticker.tick() => {}
        }

        // The webhook may already have settled the job.
        match engine.job_state(&session_id, &provider_job_id).await {
            Ok(JobState::Active(_)) => {}
            Ok(JobState::Terminal(status)) => {
                logger.log_progress(&format!("job already {}, stopping", status));
                return PollExit::Terminal(status);
            }
            Ok(JobState::Superseded) => return PollExit::Superseded,
            Ok(JobState::Missing) => return PollExit::SessionGone,
            Err(e) => {
                logger.log_warning(&format!("could not read session: {}", e));
                continue;
            }
        }

        if started.elapsed() >= config.poll_max_duration {
            let timed_out = ProviderStatus::Failed {
                message: format!(
                    "Provider did not finish within {} seconds",
                    config.poll_max_duration.as_secs()
                ),
            };
            if let Err(e) = engine
                .apply_observation(&session_id, &provider_job_id, &timed_out, Channel::Poll)
                .await
            {
                logger.log_error(&format!("could not record timeout: {}", e));
            }
            return PollExit::TimedOut;
        }

        let tick = poll_once(
            &engine,
            provider.as_ref(),
            &session_id,
            &provider_job_id,
            Channel::Poll,
        )
        .instrument(logger.create_span());

        let result = tokio::select! {
            _ = cancel.cancelled() => return PollExit::Cancelled,
            result = tick => result,
        };

        match result {
            Ok(outcome) if outcome.disposition == Disposition::Stale => {
                return PollExit::Superseded;
            }
            Ok(outcome) => {
                if let Some(status) = outcome.job_status.filter(|s| s.is_terminal()) {
                    return PollExit::Terminal(status);
                }
            }
            // Transient: the next tick tries again.
            Err(e) => logger.log_warning(&format!("poll failed: {}", e)),
        }
    }
}

struct PollTask {
    generation: u64,
    provider_job_id: ProviderJobId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the per-session poll tasks.
///
/// Starting a poller for a session that already has one replaces it.
/// Finished loops remove themselves; dropping the scheduler cancels every
/// loop it still owns.
pub struct PollScheduler {
    engine: Arc<Reconciler>,
    provider: Arc<dyn ClipProvider>,
    tasks: Arc<Mutex<HashMap<SessionId, PollTask>>>,
    next_generation: AtomicU64,
}

impl PollScheduler {
    pub fn new(engine: Arc<Reconciler>, provider: Arc<dyn ClipProvider>) -> Self {
        Self {
            engine,
            provider,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Start polling `provider_job_id` for a session.
    pub fn start(&self, session_id: SessionId, provider_job_id: ProviderJobId) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let engine = self.engine.clone();
        let provider = self.provider.clone();
        let tasks = self.tasks.clone();
        let token = cancel.clone();
        let sid = session_id.clone();
        let pid = provider_job_id.clone();

        // Held across spawn so the task cannot deregister before it is registered.
        let mut registry = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let handle = tokio::spawn(async move {
            let exit = run_poll_loop(engine, provider, sid.clone(), pid.clone(), token).await;
            info!(session_id = %sid, provider_job_id = %pid, exit = ?exit, "Poll loop finished");

            let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
            if tasks.get(&sid).map(|t| t.generation) == Some(generation) {
                tasks.remove(&sid);
            }
            set_active_pollers(tasks.len());
        });

        if let Some(previous) = registry.insert(
            session_id.clone(),
            PollTask {
                generation,
                provider_job_id,
                cancel,
                handle,
            },
        ) {
            debug!(session_id = %session_id, previous = %previous.provider_job_id, "Replacing poller");
            previous.cancel.cancel();
        }
        set_active_pollers(registry.len());
    }

    /// Stop a session's poller. Returns whether one was running.
    pub fn stop(&self, session_id: &SessionId) -> bool {
        let mut registry = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let removed = registry.remove(session_id);
        set_active_pollers(registry.len());
        match removed {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_polling(&self, session_id: &SessionId) -> bool {
        self.polling_job(session_id).is_some()
    }

    /// Provider job currently polled for a session.
    pub fn polling_job(&self, session_id: &SessionId) -> Option<ProviderJobId> {
        let registry = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        registry.get(session_id).map(|t| t.provider_job_id.clone())
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Cancel every loop and wait for them to end.
    pub async fn shutdown(&self) {
        let drained: Vec<PollTask> = {
            let mut registry = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            registry.drain().map(|(_, task)| task).collect()
        };
        set_active_pollers(0);

        for task in &drained {
            task.cancel.cancel();
        }
        for task in drained {
            let _ = task.handle.await;
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        let registry = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in registry.values() {
            task.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcileConfig;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use reel_models::{ProcessingJob, SessionRecord};
    use reel_provider::{ProviderResult, SubmitRequest, SubmitResponse};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Provider that replays a script, repeating the last answer.
    struct ScriptedProvider {
        script: Mutex<VecDeque<ProviderStatus>>,
        last: Mutex<ProviderStatus>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ProviderStatus>, delay: Duration) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(ProviderStatus::Processing),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ClipProvider for ScriptedProvider {
        async fn submit(&self, _request: &SubmitRequest) -> ProviderResult<SubmitResponse> {
            unreachable!("not used by the poller")
        }

        async fn query(&self, _job_id: &ProviderJobId) -> ProviderResult<ProviderStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let next = self.script.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(status) = next {
                *last = status;
            }
            Ok(last.clone())
        }
    }

    fn setup(config: ReconcileConfig) -> (Arc<MemoryJobStore>, Arc<Reconciler>) {
        let store = Arc::new(MemoryJobStore::new());
        let mut record = SessionRecord::new(SessionId::from("s-1"), "owner-1");
        record.job = Some(ProcessingJob::submitted(
            record.session_id.clone(),
            ProviderJobId::from("p-1"),
        ));
        store.insert(record);
        let engine = Arc::new(Reconciler::new(store.clone(), config));
        (store, engine)
    }

    fn fast_config() -> ReconcileConfig {
        ReconcileConfig {
            poll_interval: Duration::from_secs(10),
            poll_request_timeout: Duration::from_secs(5),
            ..ReconcileConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_completion() {
        let (store, engine) = setup(fast_config());
        let provider = Arc::new(ScriptedProvider::new(
            vec![
                ProviderStatus::Processing,
                ProviderStatus::Processing,
                ProviderStatus::Completed {
                    clips: vec![json!({ "id": "a" })],
                },
            ],
            Duration::ZERO,
        ));

        let exit = run_poll_loop(
            engine,
            provider.clone(),
            SessionId::from("s-1"),
            ProviderJobId::from("p-1"),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, PollExit::Terminal(JobStatus::Completed));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get(&SessionId::from("s-1")).unwrap().clips.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_never_overlaps() {
        let (_store, engine) = setup(ReconcileConfig {
            poll_request_timeout: Duration::from_secs(60),
            ..fast_config()
        });
        // Each query outlives two ticks.
        let provider = Arc::new(ScriptedProvider::new(vec![], Duration::from_secs(25)));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_poll_loop(
            engine,
            provider.clone(),
            SessionId::from("s-1"),
            ProviderJobId::from("p-1"),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(120)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap(), PollExit::Cancelled);
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(provider.calls.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_fails_job_after_max_duration() {
        let (store, engine) = setup(ReconcileConfig {
            poll_max_duration: Duration::from_secs(60),
            ..fast_config()
        });
        let provider = Arc::new(ScriptedProvider::new(vec![], Duration::ZERO));

        let exit = run_poll_loop(
            engine,
            provider,
            SessionId::from("s-1"),
            ProviderJobId::from("p-1"),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(exit, PollExit::TimedOut);
        let job = store.get(&SessionId::from("s-1")).unwrap().job.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("60 seconds"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_webhook_settles_job() {
        let (store, engine) = setup(fast_config());
        let provider = Arc::new(ScriptedProvider::new(vec![], Duration::ZERO));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_poll_loop(
            engine.clone(),
            provider.clone(),
            SessionId::from("s-1"),
            ProviderJobId::from("p-1"),
            cancel,
        ));
        tokio::time::sleep(Duration::from_secs(15)).await;

        engine
            .apply_observation(
                &SessionId::from("s-1"),
                &ProviderJobId::from("p-1"),
                &ProviderStatus::Completed {
                    clips: vec![json!({ "id": "w" })],
                },
                Channel::Webhook,
            )
            .await
            .unwrap();
        let calls_before = provider.calls.load(Ordering::SeqCst);

        assert_eq!(task.await.unwrap(), PollExit::Terminal(JobStatus::Completed));
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(store.get(&SessionId::from("s-1")).unwrap().clips.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_replaces_and_stops() {
        let (_store, engine) = setup(fast_config());
        let provider: Arc<dyn ClipProvider> =
            Arc::new(ScriptedProvider::new(vec![], Duration::ZERO));
        let scheduler = PollScheduler::new(engine, provider);
        let sid = SessionId::from("s-1");

        scheduler.start(sid.clone(), ProviderJobId::from("p-1"));
        scheduler.start(sid.clone(), ProviderJobId::from("p-1"));
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.polling_job(&sid), Some(ProviderJobId::from("p-1")));

        assert!(scheduler.stop(&sid));
        assert!(!scheduler.stop(&sid));
        assert!(!scheduler.is_polling(&sid));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_loop_deregisters_itself() {
        let (_store, engine) = setup(fast_config());
        let provider: Arc<dyn ClipProvider> = Arc::new(ScriptedProvider::new(
            vec![ProviderStatus::Failed {
                message: "bad input".into(),
            }],
            Duration::ZERO,
        ));
        let scheduler = PollScheduler::new(engine, provider);
        let sid = SessionId::from("s-1");

        scheduler.start(sid.clone(), ProviderJobId::from("p-1"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!scheduler.is_polling(&sid));
    }
}
