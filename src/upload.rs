//! Attached-media upload tracking: one in-flight upload per composed
//! message, with policy validation before any network call, observable
//! monotone progress, and cancellation that leaves no residue.

use crate::history::GatewayError;
use crate::types::message::{LocalMessageId, MediaRef};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};

const DEFAULT_MAX_BYTES: u64 = 25 * 1024 * 1024;

/// A file the caller wants to attach, still on this device.
#[derive(Clone)]
pub struct MediaFile {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for MediaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFile")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Uploading,
    Done,
    Error,
}

#[derive(Debug, Clone)]
pub struct UploadProgress {
    /// 0–100, monotonically increasing.
    pub percent: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum UploadError {
    #[error("unsupported media type {0}")]
    UnsupportedType(String),
    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },
    /// Network-class failure; the owning message goes `failed` without
    /// ever reaching `sending`.
    #[error("upload failed: {0}")]
    Failed(String),
    /// The storage backend rejected the file outright.
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload cancelled")]
    Cancelled,
}

/// Validation applied before any byte leaves the device.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub allowed_mime_prefixes: Vec<String>,
    pub max_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_mime_prefixes: vec![
                "image/".to_string(),
                "application/".to_string(),
                "text/".to_string(),
            ],
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, file: &MediaFile) -> Result<(), UploadError> {
        if !self
            .allowed_mime_prefixes
            .iter()
            .any(|prefix| file.mime_type.starts_with(prefix.as_str()))
        {
            return Err(UploadError::UnsupportedType(file.mime_type.clone()));
        }
        let size = file.data.len() as u64;
        if size > self.max_bytes {
            return Err(UploadError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

/// Media storage backend, supplied by the embedding application. Reports
/// byte progress (0–100) through the channel as the transfer advances.
#[async_trait]
pub trait MediaGateway: Send + Sync {
    async fn upload(
        &self,
        file: MediaFile,
        progress: mpsc::Sender<u8>,
    ) -> Result<MediaRef, GatewayError>;
}

/// One in-flight upload, owned by the message being composed.
pub struct UploadTask {
    pub local_id: LocalMessageId,
    progress_rx: watch::Receiver<UploadProgress>,
    result_rx: oneshot::Receiver<Result<MediaRef, UploadError>>,
    handle: JoinHandle<()>,
}

impl UploadTask {
    pub fn progress(&self) -> UploadProgress {
        self.progress_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadProgress> {
        self.progress_rx.clone()
    }

    /// Handle for cancelling the upload from another task (e.g. when the
    /// conversation view closes before the send went out).
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.abort_handle()
    }

    /// Cancels the transfer. Observers see a terminal `Error` progress;
    /// `wait` on this task would have returned `Cancelled`.
    pub fn cancel(self) {
        self.handle.abort();
    }

    /// Waits for the transfer to finish and yields the media reference to
    /// attach to the pending send.
    pub async fn wait(self) -> Result<MediaRef, UploadError> {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => Err(UploadError::Cancelled),
        }
    }
}

pub struct UploadCoordinator {
    gateway: Arc<dyn MediaGateway>,
    policy: UploadPolicy,
}

impl UploadCoordinator {
    pub fn new(gateway: Arc<dyn MediaGateway>, policy: UploadPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Validates the file against policy and starts the transfer. Policy
    /// violations fail fast, before any network call.
    pub fn start(
        &self,
        local_id: LocalMessageId,
        file: MediaFile,
    ) -> Result<UploadTask, UploadError> {
        self.policy.validate(&file)?;

        let (progress_tx, progress_rx) = watch::channel(UploadProgress {
            percent: 0,
            status: UploadStatus::Pending,
            error: None,
        });
        let (result_tx, result_rx) = oneshot::channel();
        let gateway = self.gateway.clone();
        let task_id = local_id.clone();
        let handle = tokio::spawn(async move {
            run_upload(gateway, task_id, file, progress_tx, result_tx).await;
        });

        Ok(UploadTask {
            local_id,
            progress_rx,
            result_rx,
            handle,
        })
    }
}

async fn run_upload(
    gateway: Arc<dyn MediaGateway>,
    local_id: LocalMessageId,
    file: MediaFile,
    progress: watch::Sender<UploadProgress>,
    result_tx: oneshot::Sender<Result<MediaRef, UploadError>>,
) {
    // If this task is aborted mid-transfer the guard still flips the
    // observable status to a terminal error; it is defused on the normal
    // completion paths below.
    let guard = scopeguard::guard(progress.clone(), |p| {
        p.send_modify(|state| {
            state.status = UploadStatus::Error;
            state.error = Some("upload cancelled".to_string());
        });
    });

    progress.send_modify(|state| state.status = UploadStatus::Uploading);

    let (bytes_tx, mut bytes_rx) = mpsc::channel::<u8>(16);
    let upload = gateway.upload(file, bytes_tx);
    tokio::pin!(upload);

    let mut last = 0u8;
    let mut reporting = true;
    let outcome = loop {
        tokio::select! {
            result = &mut upload => break result,
            maybe = bytes_rx.recv(), if reporting => {
                match maybe {
                    Some(reported) => {
                        let clamped = reported.min(100);
                        // Progress never moves backwards, whatever the backend reports.
                        if clamped > last {
                            last = clamped;
                            progress.send_modify(|state| state.percent = clamped);
                        }
                    }
                    // Backend dropped its reporter; keep waiting on the
                    // transfer itself.
                    None => reporting = false,
                }
            }
        }
    };

    let _ = scopeguard::ScopeGuard::into_inner(guard);

    match outcome {
        Ok(media) => {
            debug!(target: "Upload", "Upload for {local_id} complete: {}", media.url);
            progress.send_modify(|state| {
                state.percent = 100;
                state.status = UploadStatus::Done;
            });
            let _ = result_tx.send(Ok(media));
        }
        Err(e) => {
            let error = if e.is_retryable() {
                UploadError::Failed(e.to_string())
            } else {
                UploadError::Rejected(e.to_string())
            };
            progress.send_modify(|state| {
                state.status = UploadStatus::Error;
                state.error = Some(error.to_string());
            });
            let _ = result_tx.send(Err(error));
        }
    }
}
