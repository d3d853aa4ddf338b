//! Tracking table of in-flight uploads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use reel_models::{UploadId, UploadState, UploadStatus};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{UploadError, UploadResult};

/// Worker-side handle on one upload.
#[derive(Debug)]
pub struct UploadEntry {
    pub state: UploadState,
    pub start_time: DateTime<Utc>,
    started: Instant,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl UploadEntry {
    pub fn new(pause: watch::Sender<bool>, cancel: CancellationToken) -> Self {
        Self {
            state: UploadState::Starting,
            start_time: Utc::now(),
            started: Instant::now(),
            pause,
            cancel,
        }
    }

    pub fn status(&self) -> UploadStatus {
        UploadStatus {
            state: self.state,
            start_time: self.start_time,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// At most one entry per upload id. Entries are inserted on start and
/// removed when the upload reaches a terminal state.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    entries: HashMap<UploadId, UploadEntry>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &UploadId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: UploadId, entry: UploadEntry) -> UploadResult<()> {
        if self.entries.contains_key(&id) {
            return Err(UploadError::AlreadyActive(id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: &UploadId) -> UploadResult<&UploadEntry> {
        self.entries
            .get(id)
            .ok_or_else(|| UploadError::NotFound(id.clone()))
    }

    pub fn status(&self, id: &UploadId) -> UploadResult<UploadStatus> {
        self.get(id).map(UploadEntry::status)
    }

    /// Move an entry to `next`. Returns `Ok(false)` when the transition is
    /// not legal from the current state.
    pub fn transition(&mut self, id: &UploadId, next: UploadState) -> UploadResult<bool> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| UploadError::NotFound(id.clone()))?;
        if !entry.state.can_transition_to(next) {
            return Ok(false);
        }
        entry.state = next;
        Ok(true)
    }

    /// `uploading -> paused`; a no-op from any other state.
    pub fn pause(&mut self, id: &UploadId) -> UploadResult<bool> {
        if self.get(id)?.state != UploadState::Uploading {
            return Ok(false);
        }
        self.transition(id, UploadState::Paused)?;
        let entry = self.get(id)?;
        entry.pause.send_replace(true);
        Ok(true)
    }

    /// `paused -> uploading`; a no-op from any other state.
    pub fn resume(&mut self, id: &UploadId) -> UploadResult<bool> {
        if self.get(id)?.state != UploadState::Paused {
            return Ok(false);
        }
        self.transition(id, UploadState::Uploading)?;
        let entry = self.get(id)?;
        entry.pause.send_replace(false);
        Ok(true)
    }

    pub fn remove(&mut self, id: &UploadId) -> Option<UploadEntry> {
        self.entries.remove(id)
    }

    /// Cancel and forget every tracked upload.
    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.cancel();
        }
    }
}
