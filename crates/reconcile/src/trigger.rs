use std::time::Duration;

use tether_core::{TetherError, TetherResult};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Fixed-interval resync timer. The first tick fires one period after construction.
#[derive(Debug)]
pub struct ResyncTrigger {
    interval: Interval,
    period: Duration,
}

impl ResyncTrigger {
    pub fn new(period: Duration) -> TetherResult<Self> {
        if period.is_zero() {
            return Err(TetherError::Configuration("resync period must be positive".into()));
        }
        let start = Instant::now()
            .checked_add(period)
            .ok_or_else(|| TetherError::Configuration(format!("resync period {:?} is too large", period)))?;
        let mut interval = interval_at(start, period);
        // a slow fetch or write must not cause a burst of catch-up ticks
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Self { interval, period })
    }

    pub fn period(&self) -> Duration { self.period }

    /// Wait for the next tick. Cancel-safe.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Release the timer.
    pub fn stop(self) {
        debug!(period = ?self.period, "resync trigger stopped");
    }
}
