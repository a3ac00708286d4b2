//! ECU Consumer Agent
//!
//! Watches the handoff slot, applies one artifact at a time, acknowledges it
//! and then frees the slot. Faults while applying are reported and the loop
//! carries on. A shutdown mid-apply leaves the artifact in place unacknowledged.

use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handoff::{AckFolder, HandoffSlot};
use super::ticker::Ticker;
use crate::engine::events::{Reporter, StatusColor};

/// Application faults; always contained by the agent
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("update refused: {0}")]
    Refused(String),
    #[error("interrupted by shutdown")]
    Interrupted,
}

/// How an artifact is applied on the ECU
#[async_trait]
pub trait FirmwareApplier: Send + Sync {
    async fn apply(&self, artifact: &Path) -> Result<(), ApplyError>;
}

/// Reads the image and waits a fixed time in place of flashing it
#[derive(Debug, Clone)]
pub struct SimulatedApplier {
    duration: Duration,
}

impl SimulatedApplier {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl FirmwareApplier for SimulatedApplier {
    async fn apply(&self, artifact: &Path) -> Result<(), ApplyError> {
        let image = tokio::fs::read(artifact).await?;
        tokio::time::sleep(self.duration).await;
        info!(path = %artifact.display(), bytes = image.len(), "update applied");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyResult {
    Success { filename: String },
    Crashed { filename: Option<String>, reason: String },
    Interrupted { filename: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Applying { filename: String },
    Done(ApplyResult),
}

pub struct ConsumerAgent<A: FirmwareApplier> {
    slot: HandoffSlot,
    acks: AckFolder,
    applier: A,
    poll_interval: Duration,
    reporter: Reporter,
    state: ConsumerState,
    cancel: CancellationToken,
}

impl<A: FirmwareApplier> ConsumerAgent<A> {
    pub fn new(
        slot: HandoffSlot,
        acks: AckFolder,
        applier: A,
        poll_interval: Duration,
        reporter: Reporter,
    ) -> Self {
        Self {
            slot,
            acks,
            applier,
            poll_interval,
            reporter,
            state: ConsumerState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Watch until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        self.reporter.status("Listening", StatusColor::Green);
        self.reporter.log("[o] ECU online. Waiting for firmware...");

        self.cancel = cancel.clone();
        let mut ticker = Ticker::new(self.poll_interval, cancel);
        loop {
            self.poll_once().await;
            if !ticker.tick().await {
                break;
            }
        }

        info!("ECU watch loop stopped");
    }

    /// Process at most one artifact, the first by name
    pub async fn poll_once(&mut self) -> Option<ApplyResult> {
        let next = match self.resident().await {
            Ok(names) => names.into_iter().next(),
            Err(e) => {
                return Some(self.finish(ApplyResult::Crashed {
                    filename: None,
                    reason: e.to_string(),
                }))
            }
        };
        let filename = next?;

        self.transition(ConsumerState::Applying {
            filename: filename.clone(),
        });
        self.reporter.status("Applying Update", StatusColor::Amber);
        self.reporter.log(format!(" New update '{}' detected!", filename));
        self.reporter.log(" Applying update...");

        let result = match self.apply_and_acknowledge(&filename).await {
            Ok(()) => ApplyResult::Success { filename },
            Err(ApplyError::Interrupted) => ApplyResult::Interrupted { filename },
            Err(e) => ApplyResult::Crashed {
                filename: Some(filename),
                reason: e.to_string(),
            },
        };

        Some(self.finish(result))
    }

    async fn resident(&self) -> io::Result<Vec<String>> {
        self.slot.ensure().await?;
        self.acks.ensure().await?;
        self.slot.resident().await
    }

    /// The token is written while the artifact still occupies the slot, so no
    /// new delivery of the same name can start before it exists.
    async fn apply_and_acknowledge(&self, filename: &str) -> Result<(), ApplyError> {
        let path = self.slot.path_for(filename);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ApplyError::Interrupted),
            applied = self.applier.apply(&path) => applied?,
        }
        self.reporter.log(" Update applied successfully.");

        self.acks.emit(filename).await?;
        self.reporter.log("   Sent acknowledgment to TCU.");

        tokio::fs::remove_file(&path).await?;
        self.reporter.log(format!(" Cleaned up '{}'.", filename));
        Ok(())
    }

    fn finish(&mut self, result: ApplyResult) -> ApplyResult {
        match &result {
            ApplyResult::Success { filename } => {
                info!(%filename, "update acknowledged");
                self.reporter.status("Success", StatusColor::Green);
            }
            ApplyResult::Crashed { filename, reason } => {
                error!(filename = ?filename, %reason, "ECU failed to apply update");
                self.reporter.log(format!("ECU CRITICAL ERROR: {}", reason));
                self.reporter.status("Crashed", StatusColor::Red);
            }
            ApplyResult::Interrupted { filename } => {
                warn!(%filename, "apply interrupted, artifact left in slot");
                self.reporter.log(format!(" Update of '{}' interrupted.", filename));
            }
        }

        self.transition(ConsumerState::Done(result.clone()));
        self.transition(ConsumerState::Idle);
        if !matches!(result, ApplyResult::Interrupted { .. }) {
            self.reporter.status("Listening", StatusColor::Green);
        }
        result
    }

    fn transition(&mut self, next: ConsumerState) {
        tracing::debug!(from = ?self.state, to = ?next, "consumer state");
        self.state = next;
    }
}
