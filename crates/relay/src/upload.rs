//! Inbound side of the relay: one task per file being uploaded.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::download::{ChunkSink, DownloadTask, StreamEnd};
use crate::{QueuePolicy, RelayError, TEMP_SUFFIX};

/// Why an upload is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every declared byte arrived; publish the file.
    Normal,
    /// Transfer, integrity or filesystem failure, or a newer upload
    /// superseded this one.
    Error,
}

impl StopReason {
    fn stream_end(self) -> StreamEnd {
        match self {
            Self::Normal => StreamEnd::Complete,
            Self::Error => StreamEnd::Aborted,
        }
    }
}

/// Tunables applied to every upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Buffering policy for downloads joining the upload.
    pub queue: QueuePolicy,
    /// Leave the temporary file on disk after a failed upload.
    pub keep_partial_uploads: bool,
}

/// Temp-file handle and lifecycle. Written only by the body reader;
/// locked so a supersede from another task is serialized with writes.
struct FileState {
    file: Option<File>,
    written: u64,
    stopped: Option<StopReason>,
}

struct History {
    chunks: Vec<Bytes>,
    received: u64,
}

struct Consumers {
    downloads: Vec<Arc<DownloadTask>>,
    /// Set once the upload has stopped; late joiners are closed with it.
    end: Option<StreamEnd>,
}

/// An in-flight upload and its live audience.
///
/// Lock order is `history` then `consumers`, in both [`receive`] and
/// [`add_download`]; that ordering is what gives every joiner each chunk
/// exactly once.
///
/// [`receive`]: Self::receive
/// [`add_download`]: Self::add_download
pub struct UploadTask {
    file_dir: PathBuf,
    file_path: PathBuf,
    temp_path: PathBuf,
    declared_size: u64,
    options: UploadOptions,
    stopped: AtomicBool,
    file: Mutex<FileState>,
    history: Mutex<History>,
    consumers: Mutex<Consumers>,
}

impl UploadTask {
    /// Creates an upload of `declared_size` bytes into `file_path`.
    ///
    /// A declared size of zero is rejected.
    pub fn new(
        file_dir: impl Into<PathBuf>,
        file_path: impl Into<PathBuf>,
        declared_size: u64,
        options: UploadOptions,
    ) -> Result<Arc<Self>, RelayError> {
        if declared_size == 0 {
            return Err(RelayError::EmptyUpload);
        }

        let file_path = file_path.into();
        let mut temp_path = file_path.clone().into_os_string();
        temp_path.push(TEMP_SUFFIX);

        Ok(Arc::new(Self {
            file_dir: file_dir.into(),
            file_path,
            temp_path: PathBuf::from(temp_path),
            declared_size,
            options,
            stopped: AtomicBool::new(false),
            file: Mutex::new(FileState {
                file: None,
                written: 0,
                stopped: None,
            }),
            history: Mutex::new(History {
                chunks: Vec::new(),
                received: 0,
            }),
            consumers: Mutex::new(Consumers {
                downloads: Vec::new(),
                end: None,
            }),
        }))
    }

    /// Final destination of the upload.
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    /// Where bytes are written until the upload completes.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Length declared by the uploader; joiners advertise it as their
    /// content length.
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Bytes received so far.
    pub async fn received_bytes(&self) -> u64 {
        self.history.lock().await.received
    }

    /// Number of joined downloads still relaying.
    pub async fn download_count(&self) -> usize {
        self.consumers
            .lock()
            .await
            .downloads
            .iter()
            .filter(|d| d.is_live())
            .count()
    }

    /// Clears stale files, creates the directory and opens the temp file.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut state = self.file.lock().await;
        if state.stopped.is_some() {
            return Err(RelayError::Stopped);
        }
        if state.file.is_some() {
            return Ok(());
        }

        remove_stale(&self.file_path).await;
        remove_stale(&self.temp_path).await;

        fs::create_dir_all(&self.file_dir)
            .await
            .map_err(|source| RelayError::CreateDir {
                path: self.file_dir.clone(),
                source,
            })?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.temp_path)
            .await
            .map_err(|source| RelayError::OpenTemp {
                path: self.temp_path.clone(),
                source,
            })?;
        state.file = Some(file);

        info!(
            path = %self.file_path.display(),
            declared = self.declared_size,
            "upload started"
        );
        Ok(())
    }

    /// Persists a chunk, records it in history and relays it to every
    /// joined download.
    ///
    /// Must be called from the single task reading the request body.
    pub async fn receive(&self, chunk: Bytes) -> Result<(), RelayError> {
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;

        {
            let mut state = self.file.lock().await;
            if state.stopped.is_some() {
                return Err(RelayError::Stopped);
            }
            let received = state.written + len;
            if received > self.declared_size {
                return Err(RelayError::Overflow {
                    declared: self.declared_size,
                    received,
                });
            }
            let file = state.file.as_mut().ok_or(RelayError::NotStarted)?;
            file.write_all(&chunk).await?;
            state.written = received;
        }

        let downloads = {
            let mut history = self.history.lock().await;
            history.received += len;
            history.chunks.push(chunk.clone());

            let mut consumers = self.consumers.lock().await;
            consumers.downloads.retain(|d| d.is_live());
            consumers.downloads.clone()
        };

        for download in &downloads {
            download.send(chunk.clone()).await;
        }
        Ok(())
    }

    /// Joins a download: starts its send loop, replays history, then
    /// subscribes it to live chunks.
    ///
    /// If the upload has already stopped, the download is closed with the
    /// upload's outcome right after the replay. For a completed upload the
    /// replay is the whole file.
    pub async fn add_download<S: ChunkSink>(&self, download: Arc<DownloadTask>, sink: S) {
        download.start(sink);

        let history = self.history.lock().await;
        let replayed = download.preload(history.chunks.iter().cloned());

        let mut consumers = self.consumers.lock().await;
        if let Some(end) = consumers.end {
            drop(consumers);
            drop(history);
            debug!(
                path = %self.file_path.display(),
                download = %download.id(),
                ?end,
                "late join on a stopped upload"
            );
            download.close(end);
            return;
        }

        debug!(
            path = %self.file_path.display(),
            download = %download.id(),
            replayed,
            "download joined"
        );
        consumers.downloads.push(download);
    }

    /// Creates a download sized to this upload and joins it.
    pub async fn join<S: ChunkSink>(&self, sink: S) -> Arc<DownloadTask> {
        let download = DownloadTask::new(self.declared_size, self.options.queue);
        self.add_download(Arc::clone(&download), sink).await;
        download
    }

    /// Closes the temp file, publishes or discards it, and ends every
    /// joined download. Idempotent; does not wait for downloads to drain.
    pub async fn stop(&self, reason: StopReason) {
        self.stop_with(reason).await;
    }

    /// Completes the upload if every declared byte has arrived, otherwise
    /// stops it with an error.
    pub async fn finish(&self) -> Result<(), RelayError> {
        let received = self.received_bytes().await;
        if received != self.declared_size {
            warn!(
                path = %self.file_path.display(),
                received,
                declared = self.declared_size,
                "upload size mismatch"
            );
            self.stop_with(StopReason::Error).await;
            return Err(RelayError::SizeMismatch {
                declared: self.declared_size,
                received,
            });
        }

        match self.stop_with(StopReason::Normal).await {
            Some(StopReason::Normal) => Ok(()),
            _ => Err(RelayError::Stopped),
        }
    }

    /// Returns the reason applied, or `None` if the upload was already
    /// stopped.
    async fn stop_with(&self, reason: StopReason) -> Option<StopReason> {
        let mut state = self.file.lock().await;
        if state.stopped.is_some() {
            return None;
        }

        let mut reason = reason;
        let opened = match state.file.take() {
            Some(mut file) => {
                if let Err(e) = file.flush().await {
                    error!(path = %self.temp_path.display(), "flush failed: {e}");
                    reason = StopReason::Error;
                }
                true
            }
            None => false,
        };
        state.stopped = Some(reason);
        self.stopped.store(true, Ordering::Release);

        // Only touch the temp path if this task created it.
        if opened {
            match reason {
                StopReason::Normal => {
                    match fs::rename(&self.temp_path, &self.file_path).await {
                        Ok(()) => info!(
                            path = %self.file_path.display(),
                            size = state.written,
                            "upload complete"
                        ),
                        Err(e) => error!(
                            from = %self.temp_path.display(),
                            to = %self.file_path.display(),
                            "rename failed: {e}"
                        ),
                    }
                }
                StopReason::Error if self.options.keep_partial_uploads => {
                    warn!(path = %self.temp_path.display(), "upload failed, partial file kept");
                }
                StopReason::Error => {
                    remove_stale(&self.temp_path).await;
                    warn!(path = %self.file_path.display(), "upload failed");
                }
            }
        }

        let end = reason.stream_end();
        let downloads = {
            let mut consumers = self.consumers.lock().await;
            consumers.end = Some(end);
            std::mem::take(&mut consumers.downloads)
        };
        if !downloads.is_empty() {
            debug!(
                path = %self.file_path.display(),
                count = downloads.len(),
                ?end,
                "ending joined downloads"
            );
        }
        for download in downloads {
            download.close(end);
        }

        Some(reason)
    }
}

/// Removes `path`, treating "not found" as success.
async fn remove_stale(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "cannot remove file: {e}"),
    }
}
