//! Content session record.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Clip, ProcessingJob};

/// Identifier of the content session that owns an uploaded asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Persisted state of a content session as seen by the reconciliation engine.
///
/// The clip list is ordered and always written as a whole. `version` is the
/// store's opaque revision marker used for compare-and-set writes; it is
/// `None` for records that have not been read from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<ProcessingJob>,
    #[serde(default)]
    pub clips: Vec<Clip>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SessionRecord {
    /// Create an empty record for a session.
    pub fn new(session_id: SessionId, owner_id: impl Into<String>) -> Self {
        Self {
            session_id,
            owner_id: owner_id.into(),
            job: None,
            clips: Vec::new(),
            version: None,
        }
    }

    /// True if the record holds a job that has not reached a terminal state.
    pub fn has_active_job(&self) -> bool {
        self.job.as_ref().map(|j| !j.status.is_terminal()).unwrap_or(false)
    }

    /// True if a clip with the given id is already recorded.
    pub fn contains_clip(&self, clip_id: &str) -> bool {
        self.clips.iter().any(|c| c.id == clip_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobStatus, ProviderJobId};

    #[test]
    fn test_active_job_detection() {
        let mut record = SessionRecord::new(SessionId::from("s-1"), "user-1");
        assert!(!record.has_active_job());

        record.job = Some(ProcessingJob::submitted(
            record.session_id.clone(),
            ProviderJobId::from("p-1"),
        ));
        assert!(record.has_active_job());

        if let Some(job) = record.job.as_mut() {
            job.status = JobStatus::Failed;
        }
        assert!(!record.has_active_job());
    }
}
