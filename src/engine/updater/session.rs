//! Update Session Orchestration
//!
//! A `Distributor` runs at most one `UpdateSession` at a time. A session
//! probes every source, downloads the best candidate, gates it, hands it to
//! the ECU and commits the version only once the ECU has acknowledged it.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ack::AckOutcome;
use super::arbiter::UpdateArbiter;
use super::download::{TransferError, Transporter};
use super::gate::{Admission, IntegrityGate, RejectReason};
use super::handoff::{AckFolder, HandoffChannel, HandoffError, HandoffSlot};
use super::probe::{HttpProbe, UpdateAdvertisement};
use super::state::SessionMachine;
use crate::engine::config::{Config, ConfigError, ConfigStore, FolderConfig};
use crate::engine::events::{Reporter, StatusColor};

/// Why a session ended in `Failed`
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("download failed: {0}")]
    Transfer(TransferError),
    #[error("integrity check failed: {0}")]
    IntegrityRejected(RejectReason),
    #[error("handoff failed: {0}")]
    Handoff(#[from] HandoffError),
    #[error("timed out waiting for ECU acknowledgment")]
    AckTimeout,
    #[error("session cancelled")]
    Cancelled,
    #[error("advertised source '{0}' is not configured")]
    UnknownSource(String),
    #[error("could not commit version: {0}")]
    Commit(ConfigError),
}

impl From<TransferError> for SessionFailure {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Cancelled => Self::Cancelled,
            other => Self::Transfer(other),
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    NoUpdate,
    Committed(UpdateAdvertisement),
    Failed(SessionFailure),
    /// Another session was already running; nothing was done.
    Busy,
}

impl SessionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn summary(&self) -> SessionSummary {
        match self {
            Self::NoUpdate => SessionSummary {
                outcome: "no_update",
                version: None,
                source: None,
                reason: None,
            },
            Self::Committed(advertisement) => SessionSummary {
                outcome: "committed",
                version: Some(advertisement.version.to_string()),
                source: Some(advertisement.source.clone()),
                reason: None,
            },
            Self::Failed(failure) => SessionSummary {
                outcome: "failed",
                version: None,
                source: None,
                reason: Some(failure.to_string()),
            },
            Self::Busy => SessionSummary {
                outcome: "busy",
                version: None,
                source: None,
                reason: None,
            },
        }
    }
}

/// Flat, serializable view of an outcome for `--format json`
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The TCU side of the pipeline
pub struct Distributor {
    store: Arc<ConfigStore>,
    reporter: Reporter,
    cancel: CancellationToken,
    client: reqwest::Client,
    session_lock: Arc<Mutex<()>>,
}

impl Distributor {
    pub fn new(store: Arc<ConfigStore>, reporter: Reporter, cancel: CancellationToken) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("OTA-Relay-TCU")
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            store,
            reporter,
            cancel,
            client,
            session_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.session_lock.try_lock().is_err()
    }

    /// Run one session to completion on the current task
    pub async fn check(&self) -> SessionOutcome {
        let Ok(_guard) = self.session_lock.try_lock() else {
            self.reject_busy();
            return SessionOutcome::Busy;
        };
        self.run_session().await
    }

    /// Start a session in the background
    ///
    /// Returns `None` when a session is already in flight.
    pub fn trigger(self: &Arc<Self>) -> Option<JoinHandle<SessionOutcome>> {
        let Ok(guard) = Arc::clone(&self.session_lock).try_lock_owned() else {
            self.reject_busy();
            return None;
        };

        let distributor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            distributor.run_session().await
        }))
    }

    /// Persist the security posture; the next session picks it up at its gate step.
    pub fn set_security(&self, enabled: bool) -> Result<(), ConfigError> {
        self.store.set_checksum_verification(enabled)?;
        let state = if enabled { "ENABLED" } else { "DISABLED" };
        self.reporter
            .log(format!("Checksum verification {}.", state));
        if !enabled {
            warn!("checksum verification disabled by operator");
        }
        Ok(())
    }

    fn reject_busy(&self) {
        info!("update session already running, trigger ignored");
        self.reporter.status("Busy", StatusColor::Amber);
        self.reporter.log("An update is already in progress.");
    }

    async fn run_session(&self) -> SessionOutcome {
        if let Err(e) = self.store.reload() {
            warn!(error = %e, "could not reload config, using last known values");
        }
        let config = self.store.snapshot();
        let folders = self.store.folders();

        let session = UpdateSession {
            config,
            folders,
            client: self.client.clone(),
            store: &self.store,
            reporter: &self.reporter,
            cancel: &self.cancel,
            machine: SessionMachine::new(self.reporter.clone()),
        };
        session.run().await
    }
}

/// One pass through the pipeline
struct UpdateSession<'a> {
    config: Config,
    folders: FolderConfig,
    client: reqwest::Client,
    store: &'a ConfigStore,
    reporter: &'a Reporter,
    cancel: &'a CancellationToken,
    machine: SessionMachine,
}

impl UpdateSession<'_> {
    async fn run(mut self) -> SessionOutcome {
        let outcome = self.drive().await;
        let elapsed = self
            .machine
            .finished_at()
            .map(|finished| (finished - self.machine.started_at()).num_milliseconds());
        info!(
            session = %self.machine.id(),
            outcome = ?outcome.summary(),
            duration_ms = ?elapsed,
            "update session finished"
        );
        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        let current = self.config.tcu.current_version;
        info!(session = %self.machine.id(), installed = %current, "update session started");

        self.machine.start_checking();
        self.reporter.log(format!(
            "TCU (v{}) checking all sources for updates...",
            current
        ));

        let probes: Vec<HttpProbe> = self
            .config
            .server
            .sources
            .iter()
            .cloned()
            .map(|source| HttpProbe::with_client(source, self.client.clone()))
            .collect();

        let Some(candidate) =
            UpdateArbiter::select_best(&probes, current, self.config.probe_timeout()).await
        else {
            self.reporter.log("No new updates found.");
            self.machine.no_update();
            return SessionOutcome::NoUpdate;
        };

        self.reporter.log(format!(
            "New update found from {} server! Version: {}",
            candidate.source.to_uppercase(),
            candidate.version
        ));

        match self.install(&candidate).await {
            Ok(()) => {
                info!(session = %self.machine.id(), version = %candidate.version, "update committed");
                SessionOutcome::Committed(candidate)
            }
            Err(failure) => {
                error!(session = %self.machine.id(), error = %failure, "update session failed");
                self.reporter.log(format!("Update failed: {}", failure));
                self.machine.fail(failure.to_string());
                SessionOutcome::Failed(failure)
            }
        }
    }

    async fn install(&mut self, candidate: &UpdateAdvertisement) -> Result<(), SessionFailure> {
        if self.cancel.is_cancelled() {
            return Err(SessionFailure::Cancelled);
        }

        let source = self
            .config
            .server
            .sources
            .iter()
            .find(|s| s.name == candidate.source)
            .cloned()
            .ok_or_else(|| SessionFailure::UnknownSource(candidate.source.clone()))?;

        self.machine.start_downloading();
        self.reporter.log(format!("Downloading {}...", candidate.filename));
        let transporter = Transporter::with_client(self.client.clone(), self.config.stall_timeout());
        let machine = &mut self.machine;
        let staged = transporter
            .download(
                &source,
                candidate,
                &self.folders.tcu_download_folder,
                self.cancel,
                |fraction| machine.update_progress(fraction),
            )
            .await?;
        self.reporter.log("Download complete.");

        self.machine.start_verifying();
        let posture = self.store.posture();
        let artifact =
            match IntegrityGate::admit(staged, &candidate.digest, posture, self.reporter).await {
                Admission::Admitted { artifact, .. } => artifact,
                Admission::Rejected { reason } => {
                    return Err(SessionFailure::IntegrityRejected(reason))
                }
            };

        self.machine.start_transferring();
        let channel = HandoffChannel::new(
            HandoffSlot::new(self.folders.ecu_shared_folder.clone()),
            AckFolder::new(self.folders.tcu_ack_folder.clone()),
        );
        let receipt = channel.deliver(artifact).await?;
        self.reporter.log(format!(
            "Transferred '{}' from {} server to ECU folder.",
            receipt.filename,
            candidate.source.to_uppercase()
        ));

        self.machine.start_awaiting_ack();
        self.reporter.log(format!(
            "Waiting for acknowledgment from ECU for {}...",
            receipt.filename
        ));
        match channel
            .await_ack(&receipt.filename, self.config.ack_policy(), self.cancel)
            .await
        {
            AckOutcome::Acknowledged => {
                self.reporter
                    .log(format!("ACK received from ECU for {}.", receipt.filename));
            }
            AckOutcome::TimedOut => {
                self.reporter.log("Timed out waiting for ECU acknowledgment.");
                return Err(SessionFailure::AckTimeout);
            }
            AckOutcome::Cancelled => return Err(SessionFailure::Cancelled),
        }

        self.store
            .commit_version(candidate.version)
            .map_err(SessionFailure::Commit)?;
        self.reporter
            .log(format!("Version updated to {}", candidate.version));
        self.machine.commit(candidate.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::ServerConfig;
    use crate::engine::events::StatusEvent;
    use crate::engine::updater::probe::SourceDescriptor;
    use crate::engine::updater::version::VersionId;

    fn store_with_sources(dir: &std::path::Path, sources: Vec<SourceDescriptor>) -> Arc<ConfigStore> {
        let mut config = Config::default();
        config.server = ServerConfig { sources };
        config.tcu.probe_timeout_ms = 200;
        let path = dir.join("config.json");
        config.save(&path).unwrap();
        Arc::new(ConfigStore::open(path).unwrap())
    }

    #[test]
    fn test_cancelled_transfer_maps_to_cancelled() {
        assert!(matches!(
            SessionFailure::from(TransferError::Cancelled),
            SessionFailure::Cancelled
        ));
        assert!(matches!(
            SessionFailure::from(TransferError::InvalidFilename("../x".to_string())),
            SessionFailure::Transfer(_)
        ));
    }

    #[test]
    fn test_summary() {
        let summary = SessionOutcome::Failed(SessionFailure::AckTimeout).summary();
        assert_eq!(summary.outcome, "failed");
        assert_eq!(
            summary.reason.as_deref(),
            Some("timed out waiting for ECU acknowledgment")
        );
        assert!(SessionOutcome::NoUpdate.summary().reason.is_none());
    }

    #[tokio::test]
    async fn test_no_sources_means_no_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_sources(dir.path(), vec![]);
        let (reporter, mut rx) = Reporter::channel();
        let distributor = Distributor::new(store.clone(), reporter, CancellationToken::new());

        let outcome = distributor.check().await;

        assert!(matches!(outcome, SessionOutcome::NoUpdate));
        assert_eq!(store.distributor_state().installed_version, VersionId::new(1, 0));

        let logs: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                StatusEvent::Log { message } => Some(message),
                _ => None,
            })
            .collect();
        assert!(logs.contains(&"No new updates found.".to_string()));
    }

    #[tokio::test]
    async fn test_second_trigger_while_running_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_sources(dir.path(), vec![]);
        let distributor = Distributor::new(store, Reporter::disabled(), CancellationToken::new());

        let _held = distributor.session_lock.try_lock().unwrap();
        assert!(distributor.is_busy());
        assert!(matches!(distributor.check().await, SessionOutcome::Busy));
    }

    #[tokio::test]
    async fn test_set_security_persists_posture() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_sources(dir.path(), vec![]);
        let distributor = Distributor::new(store.clone(), Reporter::disabled(), CancellationToken::new());

        distributor.set_security(false).unwrap();
        assert!(!store.posture().integrity_check_enabled);

        let on_disk = Config::load(store.path()).unwrap();
        assert!(!on_disk.security.checksum_verification_enabled);
    }
}
