//! Pacing for bulk re-dispatch.
//!
//! Sending hundreds of dispatch events back to back trips GitHub's secondary
//! rate limits. Most calls go through immediately; every `batch`-th call
//! pauses for a random delay between `base` and `max`.

use rand::Rng;
use std::time::Duration;
use tracing::info;

pub const DISPATCH_BATCH_SIZE: u64 = 50;
pub const DISPATCH_BASE_DELAY: Duration = Duration::from_secs(10);
pub const DISPATCH_MAX_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
pub struct DispatchBackoff {
    base: Duration,
    max: Duration,
    batch: u64,
}

impl Default for DispatchBackoff {
    fn default() -> Self {
        Self::new(DISPATCH_BASE_DELAY, DISPATCH_MAX_DELAY, DISPATCH_BATCH_SIZE)
    }
}

impl DispatchBackoff {
    pub fn new(base: Duration, max: Duration, batch: u64) -> Self {
        Self {
            base,
            max: max.max(base),
            batch: batch.max(1),
        }
    }

    /// Delay to apply after the `count`-th dispatch.
    pub fn delay_for(&self, count: u64) -> Duration {
        if count % self.batch != 0 {
            return Duration::ZERO;
        }
        if self.max <= self.base {
            return self.base;
        }
        rand::thread_rng().gen_range(self.base..self.max)
    }

    pub async fn wait(&self, count: u64) {
        let delay = self.delay_for(count);
        if delay.is_zero() {
            return;
        }
        info!("Dispatched {} events, pausing for {:?}", count, delay);
        tokio::time::sleep(delay).await;
    }
}
