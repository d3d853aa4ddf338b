//! Chunk transfer loop for one upload.

use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use reel_models::chunk_size_for;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{RemoteUpload, TransferContext, TransferEndpoint};
use crate::error::{UploadError, UploadResult};
use crate::event::UploadEvent;
use crate::metrics;

/// How one transfer ended.
#[derive(Debug)]
pub enum TransferOutcome {
    Succeeded { location: String },
    Cancelled,
    Failed(UploadError),
}

/// Why the loop stopped early.
enum Halt {
    Cancelled,
    Failed(UploadError),
}

impl From<UploadError> for Halt {
    fn from(e: UploadError) -> Self {
        Halt::Failed(e)
    }
}

/// Pause and cancel signals owned by the worker.
pub struct TransferControl {
    pub pause: watch::Receiver<bool>,
    pub cancel: CancellationToken,
}

pub struct Transfer {
    ctx: TransferContext,
    endpoint: Arc<dyn TransferEndpoint>,
    chunk_size: Option<u64>,
    retry_delays: Vec<Duration>,
    control: TransferControl,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl Transfer {
    pub fn new(
        ctx: TransferContext,
        endpoint: Arc<dyn TransferEndpoint>,
        chunk_size: Option<u64>,
        retry_delays: Vec<Duration>,
        control: TransferControl,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Self {
        Self {
            ctx,
            endpoint,
            chunk_size,
            retry_delays,
            control,
            events,
        }
    }

    fn emit(&self, event: UploadEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Drive the upload to a terminal outcome.
    ///
    /// Emits every non-terminal event; the terminal event is left to the
    /// caller so it can clean up tracking state first.
    pub async fn run(mut self) -> TransferOutcome {
        self.emit(UploadEvent::Started {
            upload_id: self.ctx.upload_id.clone(),
            bytes_total: self.ctx.file.size,
        });

        let mut remote: Option<RemoteUpload> = None;
        let result = self.drive(&mut remote).await;

        match result {
            Ok(location) => TransferOutcome::Succeeded { location },
            Err(Halt::Failed(e)) => TransferOutcome::Failed(e),
            Err(Halt::Cancelled) => {
                if let Some(remote) = remote.as_ref() {
                    match self.endpoint.discard(&self.ctx, remote).await {
                        Ok(()) => debug!(upload_id = %self.ctx.upload_id, "Discarded partial upload"),
                        Err(e) => warn!(
                            upload_id = %self.ctx.upload_id,
                            "Failed to discard partial upload: {}",
                            e
                        ),
                    }
                }
                TransferOutcome::Cancelled
            }
        }
    }

    async fn drive(&mut self, remote_slot: &mut Option<RemoteUpload>) -> Result<String, Halt> {
        let endpoint = Arc::clone(&self.endpoint);
        let endpoint: &dyn TransferEndpoint = endpoint.as_ref();
        let total = self.ctx.file.size;

        let located = match self.interruptible(endpoint.locate(&self.ctx)).await? {
            Ok(found) => found.filter(|r| r.offset <= total),
            Err(e) => {
                warn!(upload_id = %self.ctx.upload_id, "Resume lookup failed, starting over: {}", e);
                None
            }
        };

        let remote = match located {
            Some(remote) => {
                info!(
                    upload_id = %self.ctx.upload_id,
                    offset = remote.offset,
                    "Resuming partial upload"
                );
                self.emit(UploadEvent::Resuming {
                    offset: remote.offset,
                });
                remote
            }
            None => {
                let ctx = &self.ctx;
                self.with_retries(|| endpoint.create(ctx)).await?
            }
        };
        *remote_slot = Some(remote.clone());

        let chunk_size = remote
            .chunk_size
            .or(self.chunk_size)
            .filter(|c| *c > 0)
            .unwrap_or_else(|| chunk_size_for(total));

        let mut file = tokio::fs::File::open(&self.ctx.file.path)
            .await
            .map_err(UploadError::from)?;

        let mut offset = remote.offset;
        let mut last_bytes = offset;
        let mut last_at = Instant::now();

        while offset < total {
            self.wait_while_paused().await?;

            let new_offset = self
                .write_with_retries(endpoint, &remote, &mut file, offset, chunk_size)
                .await?;
            if new_offset > offset {
                metrics::record_bytes_sent(new_offset - offset);
            }
            offset = new_offset;

            // Speed over the last chunk only, not the whole upload.
            let now = Instant::now();
            let elapsed = now.duration_since(last_at).as_secs_f64();
            let bytes_per_second = if elapsed > 0.0 {
                offset.saturating_sub(last_bytes) as f64 / elapsed
            } else {
                0.0
            };
            last_bytes = offset;
            last_at = now;

            self.emit(UploadEvent::Progress {
                bytes_sent: offset,
                bytes_total: total,
                percent: offset as f64 / total as f64 * 100.0,
                bytes_per_second,
            });
        }

        self.interruptible(endpoint.finalize(&self.ctx, &remote))
            .await??;
        Ok(remote.location)
    }

    /// Write the chunk starting at `offset` under the retry ladder and
    /// return the acknowledged offset.
    ///
    /// A failed write may have stored part of the chunk, so every retry
    /// first asks the endpoint for its offset and re-slices the chunk from
    /// there. An offset conflict is a cue to re-sync, not a failure.
    async fn write_with_retries(
        &self,
        endpoint: &dyn TransferEndpoint,
        remote: &RemoteUpload,
        file: &mut tokio::fs::File,
        offset: u64,
        chunk_size: u64,
    ) -> Result<u64, Halt> {
        let total = self.ctx.file.size;
        let attempts = self.retry_delays.len().max(1);
        let mut last_error: Option<UploadError> = None;

        for attempt in 0..attempts {
            self.before_attempt(attempt, last_error.as_ref()).await?;

            let start = if last_error.is_some() {
                match self.interruptible(endpoint.offset(&self.ctx, remote)).await? {
                    Ok(synced) if synced >= offset && synced <= total => {
                        if synced != offset {
                            debug!(
                                upload_id = %self.ctx.upload_id,
                                offset,
                                synced,
                                "Re-synced offset after failed write"
                            );
                        }
                        synced
                    }
                    Ok(synced) => {
                        return Err(UploadError::protocol(format!(
                            "endpoint offset moved from {} to {} (file size {})",
                            offset, synced, total
                        ))
                        .into())
                    }
                    Err(e) if e.is_retryable() => {
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => return Err(Halt::Failed(e)),
                }
            } else {
                offset
            };
            if start == total {
                return Ok(start);
            }

            let chunk = read_chunk(file, start, chunk_size.min(total - start)).await?;
            match self
                .interruptible(endpoint.write_chunk(&self.ctx, remote, start, chunk))
                .await?
            {
                Ok(acked) if acked > start && acked <= total => return Ok(acked),
                Ok(acked) => {
                    return Err(UploadError::protocol(format!(
                        "endpoint acknowledged offset {} after writing at {}",
                        acked, start
                    ))
                    .into())
                }
                Err(e) if e.is_retryable() || e.is_offset_conflict() => {
                    debug!(
                        upload_id = %self.ctx.upload_id,
                        attempt = attempt + 1,
                        offset = start,
                        "Chunk write failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }

        Err(Halt::Failed(last_error.unwrap_or_else(|| {
            UploadError::protocol("retry ladder exhausted without an attempt")
        })))
    }

    /// Announce a retry and sleep its ladder delay.
    async fn before_attempt(
        &self,
        attempt: usize,
        last_error: Option<&UploadError>,
    ) -> Result<(), Halt> {
        let delay = self.retry_delays.get(attempt).copied().unwrap_or_default();
        if let Some(err) = last_error {
            metrics::record_retry();
            self.emit(UploadEvent::Retrying {
                attempt: attempt as u32 + 1,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });
        }
        if !delay.is_zero() {
            self.interruptible(tokio::time::sleep(delay)).await?;
        }
        Ok(())
    }

    /// Run `op` under the retry ladder: one attempt per delay, sleeping the
    /// delay first. An empty ladder still makes one attempt.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = UploadResult<T>>,
    {
        let attempts = self.retry_delays.len().max(1);
        let mut last_error: Option<UploadError> = None;

        for attempt in 0..attempts {
            self.before_attempt(attempt, last_error.as_ref()).await?;

            match self.interruptible(op()).await? {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!(
                        upload_id = %self.ctx.upload_id,
                        attempt = attempt + 1,
                        "Transfer attempt failed: {}",
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }

        Err(Halt::Failed(last_error.unwrap_or_else(|| {
            UploadError::protocol("retry ladder exhausted without an attempt")
        })))
    }

    async fn interruptible<T>(&self, fut: impl Future<Output = T>) -> Result<T, Halt> {
        tokio::select! {
            biased;
            _ = self.control.cancel.cancelled() => Err(Halt::Cancelled),
            value = fut => Ok(value),
        }
    }

    async fn wait_while_paused(&mut self) -> Result<(), Halt> {
        loop {
            if self.control.cancel.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if !*self.control.pause.borrow_and_update() {
                return Ok(());
            }
            debug!(upload_id = %self.ctx.upload_id, "Transfer paused");
            tokio::select! {
                _ = self.control.cancel.cancelled() => return Err(Halt::Cancelled),
                changed = self.control.pause.changed() => {
                    if changed.is_err() {
                        return Err(Halt::Cancelled);
                    }
                }
            }
        }
    }
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, len: u64) -> Result<Vec<u8>, Halt> {
    let mut chunk = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(UploadError::from)?;
    file.read_exact(&mut chunk).await.map_err(UploadError::from)?;
    Ok(chunk)
}
