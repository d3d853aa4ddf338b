//! Job reconciliation engine for ReelPipe.
//!
//! Converges what the clip provider reports (polls, webhooks, operator
//! re-queries) into the persisted session record:
//! - Normalization of raw provider results into clips with 0-100 scores
//! - Read-merge-write persistence with compare-and-set on the record version
//! - Per-job poll loops owned by a scheduler
//! - Submission, webhook and manual reconciliation entry points

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod poller;
pub mod service;
pub mod store;

pub use config::{ReconcileConfig, WEBHOOK_PATH};
pub use engine::{
    merge_observation, ApplyOutcome, BindOptions, Channel, Disposition, JobState, Reconciler,
};
pub use error::{ReconcileError, ReconcileResult};
pub use logging::JobLogger;
pub use normalize::{normalize_clip, normalize_clips, normalize_score};
pub use poller::{poll_once, run_poll_loop, PollExit, PollScheduler};
pub use service::{JobService, SubmitJob, SubmittedJob};
pub use store::{FirestoreJobStore, JobStore, MemoryJobStore};
