//! Ordered lifecycle events of one upload.

use serde::Serialize;
use tokio::sync::mpsc;

use reel_models::UploadId;

/// One step of an upload's lifecycle.
///
/// Order: `Started`, optionally `Resuming`, any number of `Progress` and
/// `Retrying`, then exactly one of `Succeeded`, `Error` or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    Started {
        upload_id: UploadId,
        bytes_total: u64,
    },
    Resuming {
        offset: u64,
    },
    Progress {
        bytes_sent: u64,
        bytes_total: u64,
        percent: f64,
        /// Throughput since the previous progress event
        bytes_per_second: f64,
    },
    Retrying {
        /// 1-based attempt about to run
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Succeeded {
        location: String,
    },
    Error {
        message: String,
    },
    Cancelled,
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::Succeeded { .. } | UploadEvent::Error { .. } | UploadEvent::Cancelled
        )
    }
}

/// Receiving end of an upload's event channel.
///
/// Yields a finite sequence that ends after the terminal event.
#[derive(Debug)]
pub struct UploadEvents {
    upload_id: UploadId,
    rx: mpsc::UnboundedReceiver<UploadEvent>,
}

impl UploadEvents {
    pub(crate) fn new(upload_id: UploadId, rx: mpsc::UnboundedReceiver<UploadEvent>) -> Self {
        Self { upload_id, rx }
    }

    pub fn upload_id(&self) -> &UploadId {
        &self.upload_id
    }

    /// Next event, or `None` once the upload has finished.
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        self.rx.recv().await
    }

    /// Drain until the terminal event and return everything received.
    pub async fn collect(mut self) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}
