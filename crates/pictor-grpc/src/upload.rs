//! Chunked model uploads.
//!
//! A stream carries an init message followed by chunks at increasing
//! offsets. Bytes land in `<name>.part` next to the target and replace the
//! target only after size and SHA-256 match the init message. The partial
//! file is removed on every other path, including a dropped connection.

use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use pictor_core::part_path;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::metrics;
use crate::options::ServiceOptions;
use crate::proto::file_upload_request::Request as UploadRequest;
use crate::proto::{FileChunk, FileUploadRequest, InitUploadRequest, UploadResponse};

/// Sender half of an upload acknowledgement stream
pub type AckSender = mpsc::Sender<std::result::Result<UploadResponse, Status>>;

/// Whether `name` is a plain file name inside the model directory
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

/// Removes the partial file unless the upload was committed
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl PartGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Failed to remove partial upload: {}", e),
        }
    }
}

struct Session {
    filename: String,
    expected_sha256: String,
    total_size: u64,
    target: PathBuf,
    file: fs::File,
    hasher: Sha256,
    offset: u64,
    guard: PartGuard,
}

impl Session {
    async fn open(directory: &Path, init: InitUploadRequest) -> Result<Self> {
        if !is_valid_filename(&init.filename) {
            return Err(ServiceError::InvalidArgument(format!(
                "Invalid file name: {}",
                init.filename
            )));
        }
        if init.total_size < 0 {
            return Err(ServiceError::InvalidArgument(
                "Total size must not be negative".to_string(),
            ));
        }

        let target = directory.join(&init.filename);
        let part = part_path(&target);
        let file = fs::File::create(&part).await?;
        info!(
            file = %init.filename,
            size = init.total_size,
            "Upload initiated"
        );

        Ok(Self {
            filename: init.filename,
            expected_sha256: init.sha256.to_lowercase(),
            total_size: init.total_size as u64,
            target,
            file,
            hasher: Sha256::new(),
            offset: 0,
            guard: PartGuard::new(part),
        })
    }

    async fn write(&mut self, chunk: FileChunk) -> Result<()> {
        if !chunk.filename.is_empty() && chunk.filename != self.filename {
            return Err(ServiceError::InvalidArgument(format!(
                "Chunk for {} during upload of {}",
                chunk.filename, self.filename
            )));
        }
        if chunk.offset < 0 || chunk.offset as u64 != self.offset {
            return Err(ServiceError::DataLoss(
                "Received chunk with unexpected offset".to_string(),
            ));
        }
        let end = self.offset + chunk.content.len() as u64;
        if end > self.total_size {
            return Err(ServiceError::InvalidArgument(format!(
                "Chunk exceeds announced size of {} bytes",
                self.total_size
            )));
        }

        self.file.write_all(&chunk.content).await?;
        self.hasher.update(&chunk.content);
        self.offset = end;
        Ok(())
    }

    async fn commit(mut self) -> Result<u64> {
        if self.offset != self.total_size {
            return Err(ServiceError::InvalidArgument(format!(
                "File size mismatch: expected {} bytes, received {}",
                self.total_size, self.offset
            )));
        }
        let actual = hex::encode(self.hasher.finalize_reset());
        if actual != self.expected_sha256 {
            warn!(
                file = %self.filename,
                expected = %self.expected_sha256,
                actual = %actual,
                "Upload checksum mismatch"
            );
            return Err(ServiceError::DataLoss("File validation failed".to_string()));
        }

        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.guard.path, &self.target).await?;
        self.guard.disarm();
        info!(file = %self.filename, bytes = self.offset, "Upload complete");
        Ok(self.offset)
    }
}

fn ack(filename: &str, offset: u64, message: &str) -> UploadResponse {
    UploadResponse {
        chunk_upload_success: true,
        received_offset: offset as i64,
        message: message.to_string(),
        filename: filename.to_string(),
    }
}

/// Receive uploads from `stream` into `directory`, acknowledging on `tx`.
///
/// Returns the number of files committed. A failure status is also sent on
/// `tx` as the final item.
pub async fn receive_upload<S>(
    directory: &Path,
    options: &ServiceOptions,
    stream: S,
    tx: AckSender,
) -> Result<usize>
where
    S: Stream<Item = std::result::Result<FileUploadRequest, Status>> + Unpin,
{
    match receive(directory, options, stream, &tx).await {
        Ok(committed) => Ok(committed),
        Err(e) => {
            warn!("Upload failed: {}", e);
            metrics::record_upload(0, false);
            metrics::record_error("upload_file", e.kind());
            let _ = tx.send(Err(e.to_status())).await;
            Err(e)
        }
    }
}

async fn receive<S>(
    directory: &Path,
    options: &ServiceOptions,
    mut stream: S,
    tx: &AckSender,
) -> Result<usize>
where
    S: Stream<Item = std::result::Result<FileUploadRequest, Status>> + Unpin,
{
    let mut session: Option<Session> = None;
    let mut committed = 0;

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(status) => {
                debug!("Upload stream broke off: {}", status);
                return Err(ServiceError::DataLoss(format!(
                    "Upload interrupted: {}",
                    status.message()
                )));
            }
        };
        options.check_secret(message.shared_secret.as_deref())?;

        match message.request {
            Some(UploadRequest::InitRequest(init)) => {
                if let Some(previous) = session.take() {
                    let bytes = previous.commit().await?;
                    metrics::record_upload(bytes, true);
                    committed += 1;
                }
                let opened = Session::open(directory, init).await?;
                let _ = tx
                    .send(Ok(ack(&opened.filename, 0, "File upload initiated")))
                    .await;
                session = Some(opened);
            }
            Some(UploadRequest::Chunk(chunk)) => {
                let active = session.as_mut().ok_or_else(|| {
                    ServiceError::InvalidArgument("Received chunk before init".to_string())
                })?;
                active.write(chunk).await?;
                let _ = tx
                    .send(Ok(ack(&active.filename, active.offset, "Chunk received")))
                    .await;
            }
            None => {
                return Err(ServiceError::InvalidArgument(
                    "Empty upload message".to_string(),
                ));
            }
        }
    }

    if let Some(last) = session.take() {
        let filename = last.filename.clone();
        let bytes = last.commit().await?;
        metrics::record_upload(bytes, true);
        committed += 1;
        let _ = tx
            .send(Ok(ack(&filename, bytes, "File uploaded successfully")))
            .await;
    }
    Ok(committed)
}
