//! Acknowledgment Waiting
//!
//! Bounded polling for the ECU's ack token. The waiter never blocks longer
//! than its policy allows.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handoff::{AckCheck, AckFolder};
use super::ticker::Ticker;

/// How long and how often to look for a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl AckPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Number of checks that fit in the timeout, at least one
    pub fn max_polls(&self) -> u32 {
        let interval = self.poll_interval.as_millis().max(1);
        let polls = self.timeout.as_millis().div_ceil(interval);
        polls.clamp(1, u32::MAX as u128) as u32
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    TimedOut,
    Cancelled,
}

pub struct AckWaiter {
    acks: AckFolder,
    policy: AckPolicy,
}

impl AckWaiter {
    pub fn new(acks: AckFolder, policy: AckPolicy) -> Self {
        Self { acks, policy }
    }

    /// Poll for the token of `filename`; the first valid token wins.
    ///
    /// The last look happens at the deadline itself, so a token written during
    /// the final interval still counts.
    pub async fn wait(&self, filename: &str, cancel: CancellationToken) -> AckOutcome {
        let max_polls = self.policy.max_polls();
        let mut ticker = Ticker::new(self.policy.poll_interval, cancel);

        for poll in 1..=max_polls {
            if self.check(filename, poll, max_polls).await {
                return AckOutcome::Acknowledged;
            }
            if !ticker.tick().await {
                return AckOutcome::Cancelled;
            }
        }

        if self.check(filename, max_polls + 1, max_polls).await {
            return AckOutcome::Acknowledged;
        }

        info!(filename, timeout = ?self.policy.timeout, "acknowledgment timed out");
        AckOutcome::TimedOut
    }

    async fn check(&self, filename: &str, poll: u32, max_polls: u32) -> bool {
        match self.acks.take(filename).await {
            Ok(AckCheck::Valid) => {
                info!(filename, poll, "acknowledgment received");
                true
            }
            Ok(AckCheck::Invalid(content)) => {
                warn!(filename, content = %content.trim(), "discarded acknowledgment without success marker");
                false
            }
            Ok(AckCheck::Missing) => {
                debug!(filename, poll, max_polls, "no acknowledgment yet");
                false
            }
            Err(e) => {
                warn!(filename, error = %e, "could not read acknowledgment folder");
                false
            }
        }
    }
}
