//! OTA Update Pipeline
//!
//! Components:
//! - `version` - Version ordering
//! - `verify` - Content digests
//! - `probe` - Source queries
//! - `arbiter` - Candidate selection across sources
//! - `download` - Streaming download into the staging folder
//! - `gate` - Integrity admission
//! - `handoff` - Distributor-to-ECU mailbox
//! - `ack` - Bounded acknowledgment wait
//! - `ticker` - Cancellable polling cadence
//! - `consumer` - ECU watch-apply-ack loop
//! - `state` - Session state machine
//! - `session` - Orchestration

pub mod version;
pub mod verify;
pub mod probe;
pub mod arbiter;
pub mod download;
pub mod gate;
pub mod handoff;
pub mod ack;
pub mod ticker;
pub mod consumer;
pub mod state;
pub mod session;

pub use ack::{AckOutcome, AckPolicy};
pub use consumer::{ConsumerAgent, FirmwareApplier, SimulatedApplier};
pub use gate::SecurityPosture;
pub use probe::{SourceDescriptor, UpdateAdvertisement};
pub use session::{Distributor, SessionFailure, SessionOutcome};
pub use state::{DistributorState, SessionState};
pub use version::VersionId;
