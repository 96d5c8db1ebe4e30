//! Injectable clock abstraction used by every time-sensitive connector.
//!
//! See [`Clock`] for more details.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A source of time that time-sensitive connectors
/// ([`Backoff`][backoff], [`Timeout`][timeout], [`RateLimiter`][limiter],
/// [`WorkerPool`][pool], [`CircuitBreaker`][breaker]) depend on instead of
/// calling [`tokio::time`] directly, so that tests can substitute a
/// deterministic implementation.
///
/// [backoff]: crate::connectors::retry::Backoff
/// [timeout]: crate::connectors::timeout::Timeout
/// [limiter]: crate::connectors::rate_limiter::RateLimiter
/// [pool]: crate::connectors::worker_pool::WorkerPool
/// [breaker]: crate::connectors::circuit_breaker::CircuitBreaker
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current instant, according to this clock.
    fn now(&self) -> Instant;

    /// Suspends the caller for `duration`, according to this clock.
    async fn sleep(&self, duration: Duration);
}

/// The default [`Clock`], backed by [`tokio::time`].
#[derive(Debug, Default, Clone, Copy)]
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

/// Returns the default, shared [`RealClock`] wrapped in an `Arc`, for
/// connectors constructed without an explicit clock.
pub fn real_clock() -> Arc<dyn Clock> {
    Arc::new(RealClock)
}

#[cfg(any(test, feature = "test-util"))]
pub use test_clock::TestClock;

#[cfg(any(test, feature = "test-util"))]
mod test_clock {
    use super::*;
    use tokio::sync::Notify;
    use tokio::sync::RwLock;

    /// A manually-advanced [`Clock`] for deterministic tests.
    ///
    /// `now()` starts at [`Instant::now`] when the clock is created and only
    /// moves forward when [`advance`][Self::advance] is called; [`sleep`]
    /// resolves once the clock has been advanced past the requested
    /// duration, regardless of how much wall-clock time actually elapses.
    pub struct TestClock {
        base: Instant,
        elapsed: RwLock<Duration>,
        notify: Notify,
    }

    impl TestClock {
        /// Returns a new `TestClock` starting at the current real instant.
        pub fn new() -> Self {
            TestClock {
                base: Instant::now(),
                elapsed: RwLock::new(Duration::ZERO),
                notify: Notify::new(),
            }
        }

        /// Advances the clock by `duration`, waking any pending
        /// [`sleep`][Clock::sleep] calls whose deadline has now passed.
        pub async fn advance(&self, duration: Duration) {
            {
                let mut elapsed = self.elapsed.write().await;
                *elapsed += duration;
            }
            self.notify.notify_waiters();
        }
    }

    impl Default for TestClock {
        fn default() -> Self {
            TestClock::new()
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> Instant {
            // `try_read` never blocks in practice: writers only hold the
            // lock across an `await`-free increment.
            let elapsed = *self.elapsed.try_read().expect("elapsed lock poisoned");
            self.base + elapsed
        }

        async fn sleep(&self, duration: Duration) {
            let target = self.now() + duration;
            loop {
                if self.now() >= target {
                    return;
                }
                self.notify.notified().await;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn sleep_resolves_only_after_advance() {
            let clock = Arc::new(TestClock::new());
            let waiter_clock = Arc::clone(&clock);
            let handle = tokio::spawn(async move {
                waiter_clock.sleep(Duration::from_secs(5)).await;
            });

            tokio::task::yield_now().await;
            assert!(!handle.is_finished());

            clock.advance(Duration::from_secs(5)).await;
            handle.await.unwrap();
        }
    }
}
