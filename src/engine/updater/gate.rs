//! Integrity Gate
//!
//! The one place a staged artifact is trusted or thrown away. The decision is
//! a single match over the posture and the digest comparison.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tracing::{info, warn};

use super::download::StagedArtifact;
use super::verify::IntegrityVerifier;
use crate::engine::events::Reporter;

/// Log line emitted whenever an artifact passes with verification switched off
pub const VERIFICATION_DISABLED_WARNING: &str = "WARNING: Checksum verification is disabled!";

/// Operator-controlled security switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPosture {
    pub integrity_check_enabled: bool,
}

impl Default for SecurityPosture {
    fn default() -> Self {
        Self {
            integrity_check_enabled: true,
        }
    }
}

/// Why an artifact was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    ChecksumMismatch { declared: String, computed: String },
    Unreadable(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch { .. } => write!(f, "checksum mismatch"),
            Self::Unreadable(e) => write!(f, "artifact unreadable: {}", e),
        }
    }
}

/// Gate outcome
#[derive(Debug)]
pub enum Admission {
    /// `verified` is false when the artifact passed only because checking was off.
    Admitted {
        artifact: StagedArtifact,
        verified: bool,
    },
    /// The staged file has already been deleted.
    Rejected { reason: RejectReason },
}

enum Verdict {
    Bypassed,
    Verified,
    Refused(RejectReason),
}

pub struct IntegrityGate;

impl IntegrityGate {
    /// Decide whether `artifact` may be handed off
    pub async fn admit(
        artifact: StagedArtifact,
        declared_digest: &str,
        posture: SecurityPosture,
        reporter: &Reporter,
    ) -> Admission {
        reporter.log(" Verifying file integrity...");
        let computed = Self::digest_of(&artifact).await;

        reporter.log(format!("   Server checksum: {}", declared_digest));
        match &computed {
            Ok(local) => reporter.log(format!("   Local checksum:  {}", local)),
            Err(e) => reporter.log(format!("   Local checksum:  unavailable ({})", e)),
        }

        let verdict = match (posture.integrity_check_enabled, computed) {
            (false, _) => Verdict::Bypassed,
            (true, Ok(local)) if IntegrityVerifier::matches(declared_digest, &local) => {
                Verdict::Verified
            }
            (true, Ok(local)) => Verdict::Refused(RejectReason::ChecksumMismatch {
                declared: declared_digest.to_string(),
                computed: local,
            }),
            (true, Err(e)) => Verdict::Refused(RejectReason::Unreadable(e.to_string())),
        };

        match verdict {
            Verdict::Bypassed => {
                warn!(filename = %artifact.filename, "integrity verification disabled; admitting unverified artifact");
                reporter.log(format!("    {}", VERIFICATION_DISABLED_WARNING));
                Admission::Admitted {
                    artifact,
                    verified: false,
                }
            }
            Verdict::Verified => {
                info!(filename = %artifact.filename, "checksum verified");
                reporter.log(" Checksum match! File is valid.");
                Admission::Admitted {
                    artifact,
                    verified: true,
                }
            }
            Verdict::Refused(reason) => {
                warn!(filename = %artifact.filename, %reason, "artifact rejected");
                reporter.log(" CHECKSUM MISMATCH! Deleting corrupt file.");
                let path = artifact.path.clone();
                if let Err(e) = artifact.discard().await {
                    warn!(path = %path.display(), error = %e, "could not delete rejected artifact");
                }
                Admission::Rejected { reason }
            }
        }
    }

    async fn digest_of(artifact: &StagedArtifact) -> io::Result<String> {
        let path = artifact.path.clone();
        tokio::task::spawn_blocking(move || IntegrityVerifier::digest_file(&path))
            .await
            .map_err(io::Error::other)?
    }
}
