//! A manually-advanceable [`Clock`] used to drive grace-period, backoff,
//! and heartbeat timing deterministically in tests, without racing
//! `tokio::time::pause` across multiple independently-driven transports.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use wire_session::Clock;

/// Virtual time starting at construction. `advance` moves it forward and
/// wakes every outstanding `sleep`; sleeps whose deadline has already
/// passed resolve immediately without waiting on a notification.
pub struct TestClock {
    epoch: Instant,
    elapsed: Mutex<Duration>,
    notify: Notify,
}

impl TestClock {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            epoch: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            notify: Notify::new(),
        })
    }

    /// Moves virtual time forward by `by` and wakes every pending sleep.
    pub fn advance(&self, by: Duration) {
        {
            let mut elapsed = self.elapsed.lock().unwrap();
            *elapsed += by;
        }
        self.notify.notify_waiters();
    }

    fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.epoch + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        let target = self.elapsed() + duration;
        loop {
            if self.elapsed() >= target {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after subscribing: `advance` may have run between
            // the check above and this registration.
            if self.elapsed() >= target {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_resolves_once_advance_reaches_the_deadline() {
        let clock = TestClock::new();
        let c = std::sync::Arc::clone(&clock);
        let handle = tokio::spawn(async move {
            c.sleep(Duration::from_millis(100)).await;
        });
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50));
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());
        clock.advance(Duration::from_millis(50));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sleep_with_an_already_elapsed_deadline_resolves_immediately() {
        let clock = TestClock::new();
        clock.advance(Duration::from_millis(500));
        clock.sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn now_reflects_accumulated_advances() {
        let clock = TestClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), start + Duration::from_millis(250));
    }
}
