//! Upload worker: owns the registry and runs transfers off the caller's task.
//!
//! Callers talk to the worker only through [`UploadHandle`] messages and
//! receive progress through per-upload [`UploadEvents`] channels.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reel_models::{UploadId, UploadState, UploadStatus};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::DEFAULT_RETRY_DELAYS;
use crate::endpoint::{TransferContext, TransferEndpoint};
use crate::error::{UploadError, UploadResult};
use crate::event::{UploadEvent, UploadEvents};
use crate::fingerprint::{fingerprint, FileInfo};
use crate::metrics;
use crate::registry::{UploadEntry, UploadRegistry};
use crate::transfer::{Transfer, TransferControl, TransferOutcome};

const COMMAND_BUFFER: usize = 64;

/// Arguments of [`UploadHandle::start_upload`].
#[derive(Clone)]
pub struct StartUpload {
    pub id: UploadId,
    pub path: PathBuf,
    pub endpoint: Arc<dyn TransferEndpoint>,
    pub headers: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
    /// Overrides the size-based default unless the endpoint dictates one
    pub chunk_size: Option<u64>,
    pub retry_delays: Option<Vec<Duration>>,
}

impl StartUpload {
    pub fn new(
        id: impl Into<UploadId>,
        path: impl Into<PathBuf>,
        endpoint: Arc<dyn TransferEndpoint>,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            endpoint,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            chunk_size: None,
            retry_delays: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = Some(delays);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

enum Command {
    Start {
        request: StartUpload,
        reply: oneshot::Sender<UploadResult<UploadEvents>>,
    },
    Pause {
        id: UploadId,
        reply: oneshot::Sender<UploadResult<bool>>,
    },
    Resume {
        id: UploadId,
        reply: oneshot::Sender<UploadResult<bool>>,
    },
    Cancel {
        id: UploadId,
        reply: oneshot::Sender<UploadResult<()>>,
    },
    Status {
        id: UploadId,
        reply: oneshot::Sender<UploadResult<UploadStatus>>,
    },
}

/// Messages from transfer tasks back to the worker.
enum Report {
    Uploading {
        id: UploadId,
    },
    Finished {
        id: UploadId,
        state: UploadState,
        ack: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable entry point to a running [`UploadWorker`].
///
/// The worker stops, cancelling every tracked upload, once all handles are
/// dropped.
#[derive(Clone)]
pub struct UploadHandle {
    commands: mpsc::Sender<Command>,
}

impl UploadHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<UploadResult<T>>) -> Command,
    ) -> UploadResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| UploadError::WorkerGone)?;
        rx.await.map_err(|_| UploadError::WorkerGone)?
    }

    /// Begin or resume a transfer. Fails with `AlreadyActive` while the id
    /// is still tracked.
    pub async fn start_upload(&self, request: StartUpload) -> UploadResult<UploadEvents> {
        self.request(|reply| Command::Start { request, reply }).await
    }

    /// Returns `false` when the upload is not currently uploading.
    pub async fn pause_upload(&self, id: &UploadId) -> UploadResult<bool> {
        let id = id.clone();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Returns `false` when the upload is not currently paused.
    pub async fn resume_upload(&self, id: &UploadId) -> UploadResult<bool> {
        let id = id.clone();
        self.request(|reply| Command::Resume { id, reply }).await
    }

    /// Abort the transfer and discard the partial remote object. The
    /// upload's event stream ends with `Cancelled`.
    pub async fn cancel_upload(&self, id: &UploadId) -> UploadResult<()> {
        let id = id.clone();
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn get_status(&self, id: &UploadId) -> UploadResult<UploadStatus> {
        let id = id.clone();
        self.request(|reply| Command::Status { id, reply }).await
    }
}

pub struct UploadWorker {
    registry: UploadRegistry,
    commands: mpsc::Receiver<Command>,
    reports_tx: mpsc::UnboundedSender<Report>,
    reports_rx: mpsc::UnboundedReceiver<Report>,
    shutdown: CancellationToken,
}

impl UploadWorker {
    /// Start the worker task on the current runtime.
    pub fn spawn() -> UploadHandle {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let worker = UploadWorker {
            registry: UploadRegistry::new(),
            commands,
            reports_tx,
            reports_rx,
            shutdown: CancellationToken::new(),
        };
        tokio::spawn(worker.run());
        UploadHandle { commands: tx }
    }

    async fn run(mut self) {
        debug!("Upload worker started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(report) = self.reports_rx.recv() => self.on_report(report),
            }
        }

        self.shutdown.cancel();
        self.registry.cancel_all();
        metrics::set_active(0);
        debug!("Upload worker stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request));
            }
            Command::Pause { id, reply } => {
                let result = self.registry.pause(&id);
                if matches!(result, Ok(true)) {
                    info!(upload_id = %id, "Upload paused");
                }
                let _ = reply.send(result);
            }
            Command::Resume { id, reply } => {
                let result = self.registry.resume(&id);
                if matches!(result, Ok(true)) {
                    info!(upload_id = %id, "Upload resumed");
                }
                let _ = reply.send(result);
            }
            Command::Cancel { id, reply } => {
                let result = self.registry.get(&id).map(|entry| {
                    info!(upload_id = %id, "Cancelling upload");
                    entry.cancel();
                });
                let _ = reply.send(result);
            }
            Command::Status { id, reply } => {
                let _ = reply.send(self.registry.status(&id));
            }
        }
    }

    fn start(&mut self, request: StartUpload) -> UploadResult<UploadEvents> {
        if self.registry.contains(&request.id) {
            return Err(UploadError::AlreadyActive(request.id));
        }

        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = self.shutdown.child_token();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.registry
            .insert(request.id.clone(), UploadEntry::new(pause_tx, cancel.clone()))?;
        metrics::set_active(self.registry.len());

        let id = request.id.clone();
        let span = info_span!("upload", upload_id = %id);
        let control = TransferControl {
            pause: pause_rx,
            cancel,
        };
        tokio::spawn(
            run_upload(request, control, events_tx, self.reports_tx.clone()).instrument(span),
        );

        Ok(UploadEvents::new(id, events_rx))
    }

    fn on_report(&mut self, report: Report) {
        match report {
            Report::Uploading { id } => {
                if let Err(e) = self.registry.transition(&id, UploadState::Uploading) {
                    debug!(upload_id = %id, "Ignoring progress report: {}", e);
                }
            }
            Report::Finished { id, state, ack } => {
                self.registry.remove(&id);
                metrics::set_active(self.registry.len());
                debug!(upload_id = %id, state = %state, "Upload untracked");
                let _ = ack.send(());
            }
        }
    }
}

async fn run_upload(
    request: StartUpload,
    control: TransferControl,
    events: mpsc::UnboundedSender<UploadEvent>,
    reports: mpsc::UnboundedSender<Report>,
) {
    let id = request.id.clone();

    let outcome = match FileInfo::from_path(&request.path).await {
        Ok(file) => {
            let ctx = TransferContext {
                upload_id: id.clone(),
                fingerprint: fingerprint(&file, request.endpoint.url()),
                file,
                headers: request.headers,
                metadata: request.metadata,
            };
            let _ = reports.send(Report::Uploading { id: id.clone() });

            let delays = request
                .retry_delays
                .unwrap_or_else(|| DEFAULT_RETRY_DELAYS.to_vec());
            Transfer::new(
                ctx,
                request.endpoint,
                request.chunk_size,
                delays,
                control,
                events.clone(),
            )
            .run()
            .await
        }
        Err(e) => TransferOutcome::Failed(e),
    };

    let (state, terminal) = match outcome {
        TransferOutcome::Succeeded { location } => {
            info!(location = %location, "Upload succeeded");
            metrics::record_finished("succeeded");
            (UploadState::Succeeded, UploadEvent::Succeeded { location })
        }
        TransferOutcome::Cancelled => {
            info!("Upload cancelled");
            metrics::record_finished("cancelled");
            (UploadState::Cancelled, UploadEvent::Cancelled)
        }
        TransferOutcome::Failed(e) => {
            error!("Upload failed: {}", e);
            metrics::record_finished("failed");
            (
                UploadState::Failed,
                UploadEvent::Error {
                    message: e.to_string(),
                },
            )
        }
    };

    // Untrack before announcing the end so a status query made after the
    // terminal event reports not-found.
    let (ack, acked) = oneshot::channel();
    if reports.send(Report::Finished { id, state, ack }).is_ok() {
        let _ = acked.await;
    }
    let _ = events.send(terminal);
}
