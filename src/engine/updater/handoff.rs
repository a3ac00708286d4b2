//! Distributor-to-ECU Handoff
//!
//! A directory mailbox standing in for the in-vehicle link. The slot holds at
//! most one visible artifact; acknowledgments come back as
//! `<ack_folder>/<filename>.ack` tokens that are consumed exactly once.
//!
//! The consumer writes its token before it clears the slot, so a token for a
//! filename can never land after the slot has been freed for a new delivery.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::ack::{AckOutcome, AckPolicy, AckWaiter};
use super::download::StagedArtifact;

/// Content of a successful acknowledgment token
pub const ACK_MARKER: &str = "SUCCESS";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("cannot create handoff folder {path}: {source}")]
    CreateSlot { path: PathBuf, source: io::Error },
    #[error("handoff slot still holds '{0}'")]
    SlotOccupied(String),
    #[error("cannot move '{filename}' into the handoff slot: {source}")]
    Move { filename: String, source: io::Error },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Entries starting with `.` are in-flight temp files and never count as artifacts.
fn is_visible(name: &str) -> bool {
    !name.starts_with('.')
}

async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// The folder the ECU watches
#[derive(Debug, Clone)]
pub struct HandoffSlot {
    dir: PathBuf,
}

impl HandoffSlot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub async fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Visible artifacts, sorted by name
    pub async fn resident(&self) -> io::Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_visible(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Result of inspecting an ack token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckCheck {
    Missing,
    Valid,
    /// A token was present but did not carry the success marker; it has been removed.
    Invalid(String),
}

/// The folder acknowledgments are written to
#[derive(Debug, Clone)]
pub struct AckFolder {
    dir: PathBuf,
}

impl AckFolder {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    pub fn token_path(&self, filename: &str) -> PathBuf {
        self.dir.join(format!("{}.ack", filename))
    }

    /// Write a token for `filename` (temp file, then rename)
    pub async fn emit(&self, filename: &str) -> io::Result<PathBuf> {
        self.ensure().await?;
        let token = self.token_path(filename);
        let temp = self.dir.join(format!(".{}.ack.tmp", filename));
        fs::write(&temp, ACK_MARKER).await?;
        fs::rename(&temp, &token).await?;
        Ok(token)
    }

    /// Consume the token for `filename` if one is present
    pub async fn take(&self, filename: &str) -> io::Result<AckCheck> {
        let token = self.token_path(filename);
        let content = match fs::read_to_string(&token).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(AckCheck::Missing),
            Err(e) => return Err(e),
        };

        remove_if_present(&token).await?;

        if content.trim() == ACK_MARKER {
            Ok(AckCheck::Valid)
        } else {
            Ok(AckCheck::Invalid(content))
        }
    }

    /// Remove any leftover token for `filename`
    pub async fn clear(&self, filename: &str) -> io::Result<bool> {
        remove_if_present(&self.token_path(filename)).await
    }
}

/// Proof that an artifact reached the slot
#[derive(Debug, Clone)]
pub struct HandoffReceipt {
    pub filename: String,
    pub path: PathBuf,
}

/// Moves admitted artifacts to the ECU and waits for its answer
#[derive(Debug, Clone)]
pub struct HandoffChannel {
    slot: HandoffSlot,
    acks: AckFolder,
}

impl HandoffChannel {
    pub fn new(slot: HandoffSlot, acks: AckFolder) -> Self {
        Self { slot, acks }
    }

    pub fn slot(&self) -> &HandoffSlot {
        &self.slot
    }

    pub fn acks(&self) -> &AckFolder {
        &self.acks
    }

    /// Move `artifact` into the slot
    ///
    /// The staged file is discarded if the delivery fails.
    pub async fn deliver(&self, artifact: StagedArtifact) -> Result<HandoffReceipt, HandoffError> {
        let result = self.try_deliver(&artifact).await;
        if result.is_err() {
            if let Err(e) = remove_if_present(&artifact.path).await {
                warn!(path = %artifact.path.display(), error = %e, "could not discard undelivered artifact");
            }
        }
        result
    }

    async fn try_deliver(&self, artifact: &StagedArtifact) -> Result<HandoffReceipt, HandoffError> {
        self.slot.ensure().await.map_err(|source| HandoffError::CreateSlot {
            path: self.slot.dir().to_path_buf(),
            source,
        })?;

        if let Some(resident) = self.slot.resident().await?.into_iter().next() {
            return Err(HandoffError::SlotOccupied(resident));
        }

        // A late token from an earlier, timed-out delivery must not satisfy this one.
        if self.acks.clear(&artifact.filename).await? {
            warn!(filename = %artifact.filename, "removed stale acknowledgment");
        }

        let dest = self.slot.path_for(&artifact.filename);
        if let Err(rename_err) = fs::rename(&artifact.path, &dest).await {
            warn!(error = %rename_err, "rename into slot failed, copying instead");
            self.copy_into_slot(artifact, &dest)
                .await
                .map_err(|source| HandoffError::Move {
                    filename: artifact.filename.clone(),
                    source,
                })?;
        }

        info!(filename = %artifact.filename, slot = %self.slot.dir().display(), "artifact delivered");
        Ok(HandoffReceipt {
            filename: artifact.filename.clone(),
            path: dest,
        })
    }

    /// Copy under a hidden name, publish with a rename, then drop the source.
    async fn copy_into_slot(&self, artifact: &StagedArtifact, dest: &Path) -> io::Result<()> {
        let temp = self.slot.dir().join(format!(".{}.incoming", artifact.filename));
        fs::copy(&artifact.path, &temp).await?;
        if let Err(e) = fs::rename(&temp, dest).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        fs::remove_file(&artifact.path).await
    }

    /// Wait for the ECU to acknowledge `filename`
    pub async fn await_ack(
        &self,
        filename: &str,
        policy: AckPolicy,
        cancel: &CancellationToken,
    ) -> AckOutcome {
        AckWaiter::new(self.acks.clone(), policy)
            .wait(filename, cancel.clone())
            .await
    }
}
