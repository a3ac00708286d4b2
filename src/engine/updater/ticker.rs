//! Cooperative polling cadence
//!
//! Every polling loop waits through a `Ticker` so that shutdown is observed
//! within one interval and tests can drive time with tokio's paused clock.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Ticker {
    interval: Interval,
    cancel: CancellationToken,
}

impl Ticker {
    /// The first tick fires one `period` from now.
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, cancel }
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Wait for the next tick; `false` once cancelled
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.interval.tick() => true,
        }
    }
}
