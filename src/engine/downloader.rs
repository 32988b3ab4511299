// Single-attempt document downloader: streams a remote body to disk with progress.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{lock_slot, partial_path_for, remove_if_exists};
use crate::source::traits::DocumentSource;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer truncated: {written} of {expected} bytes")]
    Truncated { written: u64, expected: u64 },
    #[error("transfer cancelled")]
    Cancelled,
}

impl DownloadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl DownloadStatus {
    fn rank(self) -> u8 {
        match self {
            DownloadStatus::Pending => 0,
            DownloadStatus::InProgress => 1,
            DownloadStatus::Complete | DownloadStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// Progress report for one transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub fraction: f64,
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub url: String,
    pub destination_path: PathBuf,
    pub bytes_written: u64,
    pub bytes_expected: Option<u64>,
    status: DownloadStatus,
}

impl DownloadSession {
    pub fn new(url: impl Into<String>, destination_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination_path: destination_path.into(),
            bytes_written: 0,
            bytes_expected: None,
            status: DownloadStatus::Pending,
        }
    }

    pub fn status(&self) -> DownloadStatus {
        self.status
    }

    /// Move the status forward. Returns `false` (and changes nothing) on a regression
    /// or on any move out of a terminal status.
    pub fn advance(&mut self, next: DownloadStatus) -> bool {
        if next.rank() <= self.status.rank() {
            return false;
        }
        self.status = next;
        true
    }

    /// `bytes_written / bytes_expected`, capped at 1.0; 0 when the length is unknown.
    pub fn fraction(&self) -> f64 {
        match self.bytes_expected {
            Some(expected) if expected > 0 => {
                (self.bytes_written as f64 / expected as f64).min(1.0)
            }
            _ => 0.0,
        }
    }

    fn progress(&self, fraction: f64) -> DownloadProgress {
        DownloadProgress {
            fraction,
            bytes_written: self.bytes_written,
            bytes_expected: self.bytes_expected,
        }
    }
}

pub struct Downloader {
    source: Arc<dyn DocumentSource>,
}

impl Downloader {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source }
    }

    /// Fetch `url` into `destination`, replacing whatever was there.
    ///
    /// The body is written to a sibling `.part` file and renamed into place only
    /// after the whole body arrived, so `destination` exists only for complete
    /// transfers. On failure or cancellation the partial file is removed.
    ///
    /// Transfers to the same destination are serialized: a second call waits
    /// until the first has renamed or removed its partial file.
    pub async fn download<F>(
        &self,
        url: &str,
        destination: &Path,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let _slot = tokio::select! {
            slot = lock_slot(destination) => slot,
            _ = cancel.cancelled() => {
                debug!("download cancelled before slot was free path={}", destination.display());
                return Err(DownloadError::Cancelled);
            }
        };
        let mut session = DownloadSession::new(url, destination);
        let partial = partial_path_for(destination);

        let result = self
            .transfer(&mut session, &partial, &mut on_progress, cancel)
            .await;

        match result {
            Ok(()) => {
                session.advance(DownloadStatus::Complete);
                on_progress(session.progress(1.0));
                info!(
                    "download complete url={} path={} bytes={}",
                    session.url,
                    destination.display(),
                    session.bytes_written
                );
                Ok(destination.to_path_buf())
            }
            Err(e) => {
                session.advance(DownloadStatus::Failed);
                if let Err(cleanup) = remove_if_exists(&partial).await {
                    warn!("partial cleanup failed path={}: {}", partial.display(), cleanup);
                }
                warn!(
                    "download failed url={} written={} expected={:?}: {}",
                    session.url, session.bytes_written, session.bytes_expected, e
                );
                Err(e)
            }
        }
    }

    async fn transfer<F>(
        &self,
        session: &mut DownloadSession,
        partial: &Path,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let destination = session.destination_path.clone();

        // No cross-session resume: always start from an empty slot.
        remove_if_exists(&destination)
            .await
            .map_err(|e| DownloadError::Transfer(format!("clearing cache slot: {}", e)))?;
        remove_if_exists(partial)
            .await
            .map_err(|e| DownloadError::Transfer(format!("clearing partial file: {}", e)))?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        on_progress(session.progress(0.0));
        session.advance(DownloadStatus::InProgress);

        let stream = tokio::select! {
            opened = self.source.open(&session.url) => {
                opened.map_err(|e| DownloadError::Transfer(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };
        session.bytes_expected = stream.info.content_length;
        debug!(
            "download opened url={} expected={:?} type={}",
            session.url, session.bytes_expected, stream.info.content_type
        );

        let mut file = tokio::fs::File::create(partial)
            .await
            .map_err(|e| DownloadError::io(partial, e))?;
        let mut chunks = stream.chunks;
        let mut last_fraction = 0.0f64;

        loop {
            let next = tokio::select! {
                next = chunks.recv() => next,
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            };
            let data = match next {
                None => break,
                Some(Ok(data)) => data,
                Some(Err(e)) => return Err(DownloadError::Transfer(e.to_string())),
            };

            file.write_all(&data)
                .await
                .map_err(|e| DownloadError::io(partial, e))?;
            session.bytes_written += data.len() as u64;

            if session.bytes_expected.is_some() {
                let fraction = session.fraction();
                if fraction > last_fraction {
                    last_fraction = fraction;
                    on_progress(session.progress(fraction));
                }
            }
        }

        if let Some(expected) = session.bytes_expected {
            if session.bytes_written < expected {
                return Err(DownloadError::Truncated {
                    written: session.bytes_written,
                    expected,
                });
            }
        }

        file.flush().await.map_err(|e| DownloadError::io(partial, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(partial, e))?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        tokio::fs::rename(partial, &destination)
            .await
            .map_err(|e| DownloadError::io(&destination, e))?;
        Ok(())
    }
}
