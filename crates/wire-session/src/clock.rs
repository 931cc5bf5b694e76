//! `Clock` collaborator: `now`/timer, injected so tests can drive
//! grace-period, backoff, and heartbeat timing deterministically instead
//! of racing real wall-clock sleeps across multiple transports.

use std::time::{Duration, Instant};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep for `duration`, measured from the moment this future is
    /// first polled.
    async fn sleep(&self, duration: Duration);
}

/// Real wall-clock time via `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
