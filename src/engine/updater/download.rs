//! Artifact Transport
//!
//! Streams an advertised artifact from its source into the staging folder,
//! reporting monotonic progress. Partial files never outlive a failed transfer.

use futures_util::StreamExt;
use reqwest::StatusCode;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::{is_plain_filename, SourceDescriptor, UpdateAdvertisement};

/// A fully downloaded artifact sitting in staging
#[derive(Debug)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub filename: String,
    pub len: u64,
}

impl StagedArtifact {
    /// Delete the staged file
    pub async fn discard(self) -> io::Result<()> {
        remove_if_present(&self.path).await
    }
}

/// Transfer error types
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("source answered HTTP {0}")]
    Status(StatusCode),
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("refusing to stage {0:?}")]
    InvalidFilename(String),
    #[error("transfer cancelled")]
    Cancelled,
}

/// Turns byte counts into a non-decreasing fraction in `[0, 1]`
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: Option<u64>,
    last: f64,
}

impl ProgressTracker {
    /// A zero or missing length means the total is unknown.
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            last: 0.0,
        }
    }

    /// Fraction after `downloaded` bytes, or `None` while the total is unknown
    pub fn advance(&mut self, downloaded: u64) -> Option<f64> {
        let total = self.total?;
        let fraction = (downloaded as f64 / total as f64).min(1.0);
        self.last = self.last.max(fraction);
        Some(self.last)
    }

    pub fn finish(&mut self) -> f64 {
        self.last = 1.0;
        self.last
    }
}

/// Downloads artifacts from update sources
pub struct Transporter {
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl Transporter {
    pub fn new(stall_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("OTA-Relay-TCU")
            .connect_timeout(stall_timeout)
            .build()
            .unwrap_or_default();
        Self::with_client(client, stall_timeout)
    }

    pub fn with_client(client: reqwest::Client, stall_timeout: Duration) -> Self {
        Self {
            client,
            stall_timeout,
        }
    }

    /// Download `advertisement` from `source` into `dest_dir`
    ///
    /// `on_progress` receives fractions in `[0, 1]`; the final call is always `1.0`.
    pub async fn download<F>(
        &self,
        source: &SourceDescriptor,
        advertisement: &UpdateAdvertisement,
        dest_dir: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<StagedArtifact, TransferError>
    where
        F: FnMut(f64),
    {
        let filename = &advertisement.filename;
        if !is_plain_filename(filename) {
            return Err(TransferError::InvalidFilename(filename.clone()));
        }

        fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(filename);
        let partial_path = dest_dir.join(format!("{}.partial", filename));

        let url = source.url(&format!("download/{}", filename));
        info!(source = %source.name, %url, "downloading artifact");

        let len = match self.stream_to(&url, &partial_path, cancel, &mut on_progress).await {
            Ok(len) => len,
            Err(e) => {
                if let Err(cleanup) = remove_if_present(&partial_path).await {
                    warn!(path = %partial_path.display(), error = %cleanup, "could not discard partial download");
                }
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&partial_path, &dest).await {
            let _ = remove_if_present(&partial_path).await;
            return Err(e.into());
        }

        debug!(path = %dest.display(), bytes = len, "artifact staged");
        Ok(StagedArtifact {
            path: dest,
            filename: filename.clone(),
            len,
        })
    }

    async fn stream_to<F>(
        &self,
        url: &str,
        partial_path: &Path,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<u64, TransferError>
    where
        F: FnMut(f64),
    {
        let stall = self.stall_timeout;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            response = tokio::time::timeout(stall, self.client.get(url).send()) => {
                response.map_err(|_| TransferError::Stalled(stall))??
            }
        };

        if !response.status().is_success() {
            return Err(TransferError::Status(response.status()));
        }

        let mut tracker = ProgressTracker::new(response.content_length());
        let mut file = File::create(partial_path).await?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = tokio::time::timeout(stall, stream.next()) => {
                    next.map_err(|_| TransferError::Stalled(stall))?
                }
            };

            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(fraction) = tracker.advance(downloaded) {
                on_progress(fraction);
            }
        }

        file.flush().await?;
        drop(file);

        on_progress(tracker.finish());
        Ok(downloaded)
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_known_total() {
        let mut tracker = ProgressTracker::new(Some(200));
        assert_eq!(tracker.advance(50), Some(0.25));
        assert_eq!(tracker.advance(200), Some(1.0));
        assert_eq!(tracker.finish(), 1.0);
    }

    #[test]
    fn test_progress_unknown_total_is_silent() {
        let mut tracker = ProgressTracker::new(None);
        assert_eq!(tracker.advance(1024), None);
        assert_eq!(tracker.finish(), 1.0);

        let mut tracker = ProgressTracker::new(Some(0));
        assert_eq!(tracker.advance(10), None);
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut tracker = ProgressTracker::new(Some(100));
        assert_eq!(tracker.advance(80), Some(0.8));
        // A lying Content-Length must not push past 1.0 or move backwards.
        assert_eq!(tracker.advance(500), Some(1.0));
        assert_eq!(tracker.advance(90), Some(1.0));
    }

    #[tokio::test]
    async fn test_unsafe_filename_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let transporter = Transporter::new(Duration::from_secs(1));
        let source = SourceDescriptor::new("malicious", "http://127.0.0.1:9");
        let advertisement = UpdateAdvertisement {
            version: "1.2".into(),
            filename: "../escape.bin".to_string(),
            digest: String::new(),
            source: "malicious".to_string(),
        };

        let result = transporter
            .download(&source, &advertisement, dir.path(), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(TransferError::InvalidFilename(_))));
    }

    #[tokio::test]
    async fn test_cancelled_transfer_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let transporter = Transporter::new(Duration::from_secs(1));
        let source = SourceDescriptor::new("oem", "http://127.0.0.1:9");
        let advertisement = UpdateAdvertisement {
            version: "1.1".into(),
            filename: "firmware_v1.1.bin".to_string(),
            digest: String::new(),
            source: "oem".to_string(),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = transporter
            .download(&source, &advertisement, dir.path(), &cancel, |_| {})
            .await;

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
