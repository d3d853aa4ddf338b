//! Client-side upload session state.

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::utils::{GB, MB};

/// Caller-chosen handle for one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct UploadId(pub String);

impl UploadId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UploadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Transfer state machine:
/// `starting -> uploading -> {paused <-> uploading} -> {succeeded | cancelled | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Starting,
    Uploading,
    Paused,
    Succeeded,
    Cancelled,
    Failed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Starting => "starting",
            UploadState::Uploading => "uploading",
            UploadState::Paused => "paused",
            UploadState::Succeeded => "succeeded",
            UploadState::Cancelled => "cancelled",
            UploadState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Succeeded | UploadState::Cancelled | UploadState::Failed
        )
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Starting, Uploading) => true,
            (Uploading, Paused) | (Paused, Uploading) => true,
            (s, Succeeded | Cancelled | Failed) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot returned by a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub state: UploadState,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Chunk size tier for a file of the given total size.
///
/// | file size      | chunk |
/// |----------------|-------|
/// | < 500MB        | 2MB   |
/// | 500MB to 1GB   | 6MB   |
/// | >= 1GB         | 16MB  |
pub fn chunk_size_for(file_size_bytes: u64) -> u64 {
    if file_size_bytes < 500 * MB {
        2 * MB
    } else if file_size_bytes < GB {
        6 * MB
    } else {
        16 * MB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_tiers() {
        assert_eq!(chunk_size_for(100 * MB), 2 * MB);
        assert_eq!(chunk_size_for(500 * MB - 1), 2 * MB);
        assert_eq!(chunk_size_for(500 * MB), 6 * MB);
        assert_eq!(chunk_size_for(700 * MB), 6 * MB);
        assert_eq!(chunk_size_for(GB), 16 * MB);
        assert_eq!(chunk_size_for(2 * GB), 16 * MB);
    }

    #[test]
    fn test_state_transitions() {
        use UploadState::*;
        assert!(Starting.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Uploading));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(!Starting.can_transition_to(Paused));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(Cancelled.is_terminal());
        assert!(!Paused.is_terminal());
    }
}
