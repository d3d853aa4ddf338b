//! Session record persistence seam.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reel_firestore::{FirestoreError, SessionRepository};
use reel_models::{ProviderJobId, SessionId, SessionRecord};

use crate::error::{ReconcileError, ReconcileResult};

/// Versioned storage of session records.
///
/// `compare_and_set` writes the whole record only if the stored version
/// still equals `record.version` (or, for `None`, the record does not exist)
/// and returns the new version. A lost race is
/// [`ReconcileError::VersionConflict`].
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, session_id: &SessionId) -> ReconcileResult<Option<SessionRecord>>;

    async fn find_by_provider_job(
        &self,
        provider_job_id: &ProviderJobId,
    ) -> ReconcileResult<Option<SessionRecord>>;

    async fn compare_and_set(&self, record: &SessionRecord) -> ReconcileResult<String>;
}

/// Firestore-backed store.
pub struct FirestoreJobStore {
    repo: SessionRepository,
}

impl FirestoreJobStore {
    pub fn new(repo: SessionRepository) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.repo
    }
}

#[async_trait]
impl JobStore for FirestoreJobStore {
    async fn load(&self, session_id: &SessionId) -> ReconcileResult<Option<SessionRecord>> {
        Ok(self.repo.get(session_id).await?)
    }

    async fn find_by_provider_job(
        &self,
        provider_job_id: &ProviderJobId,
    ) -> ReconcileResult<Option<SessionRecord>> {
        Ok(self.repo.find_by_provider_job(provider_job_id).await?)
    }

    async fn compare_and_set(&self, record: &SessionRecord) -> ReconcileResult<String> {
        self.repo.compare_and_set(record).await.map_err(|e| match e {
            FirestoreError::PreconditionFailed(msg) | FirestoreError::AlreadyExists(msg) => {
                ReconcileError::VersionConflict(msg)
            }
            other => ReconcileError::Store(other),
        })
    }
}

/// In-process store with the same compare-and-set contract.
///
/// Backs local runs without Firestore credentials and the test suites.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<SessionId, SessionRecord>,
    next_version: u64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record unconditionally.
    pub fn insert(&self, mut record: SessionRecord) -> String {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.next_version += 1;
        let version = state.next_version.to_string();
        record.version = Some(version.clone());
        state.records.insert(record.session_id.clone(), record);
        version
    }

    /// Snapshot of a stored record.
    pub fn get(&self, session_id: &SessionId) -> Option<SessionRecord> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.records.get(session_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, session_id: &SessionId) -> ReconcileResult<Option<SessionRecord>> {
        Ok(self.get(session_id))
    }

    async fn find_by_provider_job(
        &self,
        provider_job_id: &ProviderJobId,
    ) -> ReconcileResult<Option<SessionRecord>> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .records
            .values()
            .find(|r| r.job.as_ref().map(|j| &j.provider_job_id) == Some(provider_job_id))
            .cloned())
    }

    async fn compare_and_set(&self, record: &SessionRecord) -> ReconcileResult<String> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let current = state
            .records
            .get(&record.session_id)
            .and_then(|r| r.version.clone());
        if current != record.version {
            return Err(ReconcileError::VersionConflict(format!(
                "session {} expected version {:?}, found {:?}",
                record.session_id, record.version, current
            )));
        }

        state.next_version += 1;
        let version = state.next_version.to_string();
        let mut stored = record.clone();
        stored.version = Some(version.clone());
        state.records.insert(stored.session_id.clone(), stored);
        Ok(version)
    }
}
