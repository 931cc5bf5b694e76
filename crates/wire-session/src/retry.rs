//! Per-peer leaky-bucket retry budget: caps reconnect attempts until a
//! successful handshake restores capacity, and computes jittered
//! exponential backoff for the next attempt.

use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use std::sync::Arc;

struct Inner {
    consumed: u32,
    capacity: u32,
    base_interval: Duration,
    max_jitter: Duration,
    max_backoff: Duration,
    budget_restore_interval: Duration,
    restore_task: Option<JoinHandle<()>>,
}

/// A leaky-bucket attempt budget for a single peer.
///
/// `hasBudget()` iff `consumed < capacity`. Each failed attempt calls
/// [`RetryBudget::consume_budget`]; a successful handshake calls
/// [`RetryBudget::start_restoring_budget`], which decrements `consumed`
/// back toward zero on a periodic ticker.
pub struct RetryBudget {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl RetryBudget {
    pub fn new(
        capacity: u32,
        base_interval: Duration,
        max_jitter: Duration,
        max_backoff: Duration,
        budget_restore_interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                consumed: 0,
                capacity,
                base_interval,
                max_jitter,
                max_backoff,
                budget_restore_interval,
                restore_task: None,
            }),
            clock,
        })
    }

    pub fn has_budget(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.consumed < inner.capacity
    }

    pub fn consumed(&self) -> u32 {
        self.inner.lock().unwrap().consumed
    }

    /// `min(baseIntervalMs * 2^(max(0, consumed-1)), maxBackoffMs) +
    /// U[0, maxJitterMs)`.
    pub fn get_backoff(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        let exponent = inner.consumed.saturating_sub(1);
        let scaled = inner
            .base_interval
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let backoff = scaled.min(inner.max_backoff);
        let jitter_ms = if inner.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..inner.max_jitter.as_millis() as u64)
        };
        backoff + Duration::from_millis(jitter_ms)
    }

    /// Cancels any in-flight restore ticker and increments `consumed`.
    pub fn consume_budget(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.restore_task.take() {
            task.abort();
        }
        inner.consumed = inner.consumed.saturating_add(1);
    }

    /// Starts a periodic ticker that decrements `consumed` by one every
    /// `budget_restore_interval`, stopping at zero. Called on a successful
    /// handshake.
    pub fn start_restoring_budget(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.restore_task.is_some() || inner.consumed == 0 {
            return;
        }
        let interval = inner.budget_restore_interval;
        let this = Arc::clone(self);
        let clock = Arc::clone(&self.clock);
        let handle = tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                let mut inner = this.inner.lock().unwrap();
                if inner.consumed == 0 {
                    inner.restore_task = None;
                    return;
                }
                inner.consumed -= 1;
                if inner.consumed == 0 {
                    inner.restore_task = None;
                    return;
                }
            }
        });
        inner.restore_task = Some(handle);
    }

    /// Cancels the restore ticker, if any.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = inner.restore_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;

    fn budget(capacity: u32) -> Arc<RetryBudget> {
        RetryBudget::new(
            capacity,
            Duration::from_millis(150),
            Duration::from_millis(0),
            Duration::from_millis(32_000),
            Duration::from_millis(200),
            Arc::new(RealClock),
        )
    }

    #[test]
    fn has_budget_false_once_capacity_consumed() {
        let b = budget(2);
        assert!(b.has_budget());
        b.consume_budget();
        assert!(b.has_budget());
        b.consume_budget();
        assert!(!b.has_budget());
    }

    #[test]
    fn backoff_grows_exponentially_and_caps_at_max() {
        let b = budget(10);
        assert_eq!(b.get_backoff(), Duration::from_millis(150)); // consumed=0 -> exponent 0
        b.consume_budget(); // consumed=1
        assert_eq!(b.get_backoff(), Duration::from_millis(150)); // exponent max(0,0)=0
        b.consume_budget(); // consumed=2
        assert_eq!(b.get_backoff(), Duration::from_millis(300)); // exponent 1
        b.consume_budget(); // consumed=3
        assert_eq!(b.get_backoff(), Duration::from_millis(600)); // exponent 2
        for _ in 0..10 {
            b.consume_budget();
        }
        assert_eq!(b.get_backoff(), Duration::from_millis(32_000));
    }

    #[tokio::test(start_paused = true)]
    async fn start_restoring_budget_decrements_back_to_zero_then_stops() {
        let b = budget(5);
        b.consume_budget();
        b.consume_budget();
        assert_eq!(b.consumed(), 2);
        b.start_restoring_budget();
        tokio::time::advance(Duration::from_millis(201)).await;
        tokio::task::yield_now().await;
        assert_eq!(b.consumed(), 1);
        tokio::time::advance(Duration::from_millis(201)).await;
        tokio::task::yield_now().await;
        assert_eq!(b.consumed(), 0);
        assert!(b.has_budget());
    }

    #[test]
    fn consume_budget_cancels_in_flight_restore_ticker() {
        let b = budget(5);
        b.consume_budget();
        b.start_restoring_budget();
        assert!(b.inner.lock().unwrap().restore_task.is_some());
        b.consume_budget();
        assert!(b.inner.lock().unwrap().restore_task.is_none());
    }
}
