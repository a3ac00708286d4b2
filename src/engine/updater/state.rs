//! Update Session State Machine
//!
//! Tracks one session through its lifecycle and mirrors every transition to
//! observers as a status line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::version::VersionId;
use crate::engine::events::{Reporter, StatusColor};

/// Current status of an update session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionState {
    /// No session in progress
    Idle,
    /// Probing sources
    Checking,
    /// Downloading the selected artifact
    Downloading { progress: f32 },
    /// Running the integrity gate
    Verifying,
    /// Moving the artifact to the ECU slot
    Transferring,
    /// Waiting for the ECU acknowledgment
    AwaitingAck,
    /// Applied end to end and the version was committed
    Committed { version: VersionId },
    /// Session failed
    Failed { reason: String },
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl SessionState {
    /// Label shown to observers
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Checking => "Checking",
            Self::Downloading { .. } => "Downloading",
            Self::Verifying => "Verifying",
            Self::Transferring => "Transferring",
            Self::AwaitingAck => "Awaiting ACK",
            Self::Committed { .. } => "Success",
            Self::Failed { .. } => "Failed",
        }
    }

    pub fn color(&self) -> StatusColor {
        match self {
            Self::Idle => StatusColor::Gray,
            Self::Checking => StatusColor::Blue,
            Self::Downloading { .. } => StatusColor::Amber,
            Self::Verifying => StatusColor::Purple,
            Self::Transferring => StatusColor::Blue,
            Self::AwaitingAck => StatusColor::DeepPurple,
            Self::Committed { .. } => StatusColor::Green,
            Self::Failed { .. } => StatusColor::Red,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::Failed { .. })
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Checking) => true,
            (Checking, Idle | Downloading { .. } | Failed { .. }) => true,
            (Downloading { .. }, Downloading { .. } | Verifying | Failed { .. }) => true,
            (Verifying, Transferring | Failed { .. }) => true,
            (Transferring, AwaitingAck | Failed { .. }) => true,
            (AwaitingAck, Committed { .. } | Failed { .. }) => true,
            _ => false,
        }
    }
}

/// Durable distributor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorState {
    pub installed_version: VersionId,
}

/// One session's lifecycle
#[derive(Debug)]
pub struct SessionMachine {
    id: Uuid,
    state: SessionState,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    reporter: Reporter,
}

impl SessionMachine {
    pub fn new(reporter: Reporter) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            reporter,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn start_checking(&mut self) {
        self.advance(SessionState::Checking);
    }

    /// Nothing to do; the session ends back in `Idle`
    pub fn no_update(&mut self) {
        self.advance(SessionState::Idle);
        self.finished_at = Some(Utc::now());
    }

    pub fn start_downloading(&mut self) {
        self.advance(SessionState::Downloading { progress: 0.0 });
        self.reporter.progress(0.0);
    }

    /// Record download progress as a fraction in `[0, 1]`
    pub fn update_progress(&mut self, fraction: f64) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0) as f32;
        if let SessionState::Downloading { progress } = &mut self.state {
            *progress = progress.max(percent);
        }
        self.reporter.progress(f64::from(percent));
    }

    pub fn start_verifying(&mut self) {
        self.advance(SessionState::Verifying);
    }

    pub fn start_transferring(&mut self) {
        self.advance(SessionState::Transferring);
    }

    pub fn start_awaiting_ack(&mut self) {
        self.advance(SessionState::AwaitingAck);
    }

    pub fn commit(&mut self, version: VersionId) {
        self.advance(SessionState::Committed { version });
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, reason: String) {
        self.advance(SessionState::Failed { reason });
        self.finished_at = Some(Utc::now());
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "session transition");
        self.reporter.status(next.label(), next.color());
        self.state = next;
    }
}
