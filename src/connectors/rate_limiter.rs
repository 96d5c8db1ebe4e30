//! Token-bucket gate wrapping a single child.
//!
//! See [`RateLimiter`] for more details.

use crate::clock::{real_clock, Clock};
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// What a [`RateLimiter`] does when no token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Block until a token becomes available (or the context cancels),
    /// then run the child. The default.
    Wait,
    /// Return a `RateLimited` error immediately without running the child.
    Drop,
}

struct Bucket {
    rate: f64,
    burst: f64,
    mode: Mode,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Refills the bucket for the elapsed time since `last_refill`, per
    /// spec §4.12: infinite rate refills straight to `burst`, zero rate
    /// never refills.
    fn refill(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.tokens = self.burst;
        } else if self.rate > 0.0 {
            let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        }
        self.last_refill = now;
    }
}

/// Enforces a token bucket (`rate` tokens/second, `burst` max tokens) in
/// front of a single wrapped child.
///
/// `RateLimiter` is meant to be constructed once and shared across every
/// call site that should draw from the same bucket: constructing a fresh
/// instance per request defeats the point of a shared rate limit. This is a
/// documented invariant, not something the kernel enforces.
pub struct RateLimiter<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    bucket: Mutex<Bucket>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SignalSink>,
}

impl<T> RateLimiter<T>
where
    T: Send + 'static,
{
    /// Wraps `child` behind a token bucket refilling at `rate` tokens/second
    /// up to `burst` tokens, starting full. Negative `rate` is treated as
    /// zero; negative `burst` is treated as zero. Defaults to `Mode::Wait`.
    pub fn new(identity: Identity, child: BoxProcessor<T>, rate: f64, burst: f64) -> Self {
        let rate = if rate.is_sign_negative() && rate.is_finite() { 0.0 } else { rate.max(0.0) };
        let burst = burst.max(0.0);
        RateLimiter {
            identity,
            child,
            bucket: Mutex::new(Bucket {
                rate,
                burst,
                mode: Mode::Wait,
                tokens: burst,
                last_refill: Instant::now(),
            }),
            clock: real_clock(),
            sink: noop_sink(),
        }
    }

    /// Sets the drop-vs-wait behavior for when no token is available.
    #[must_use]
    pub fn with_mode(self, mode: Mode) -> Self {
        self.set_mode(mode);
        self
    }

    /// Replaces the clock used for refill accounting and wait delays.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches a [`SignalSink`] that observes `"ratelimiter.throttled"`
    /// signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Refills, then replaces the rate (tokens/second), so refill history
    /// isn't lost. Negative values are treated as zero.
    pub fn set_rate(&self, rate: f64) {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
        bucket.refill(now);
        bucket.rate = rate.max(0.0);
    }

    /// Refills, then replaces the burst capacity. Negative values are
    /// treated as zero.
    pub fn set_burst(&self, burst: f64) {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
        bucket.refill(now);
        bucket.burst = burst.max(0.0);
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    /// Refills, then replaces the drop-vs-wait mode.
    pub fn set_mode(&self, mode: Mode) {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
        bucket.refill(now);
        bucket.mode = mode;
    }

    /// The number of tokens currently in the bucket, after refilling as of
    /// now. Exposed for tests and introspection.
    pub fn tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
        bucket.refill(now);
        bucket.tokens
    }
}

#[async_trait]
impl<T> Processor<T> for RateLimiter<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        loop {
            if ctx.is_canceled() {
                return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                    .with_prefixed_path(self.identity.clone()));
            }

            let (rate, mode, tokens_after) = {
                let now = self.clock.now();
                let mut bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
                bucket.refill(now);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    (bucket.rate, bucket.mode, Some(bucket.tokens))
                } else {
                    (bucket.rate, bucket.mode, None)
                }
            };

            if tokens_after.is_some() {
                return self.child.process(ctx, input).await.map_err(|err| err.with_prefixed_path(self.identity.clone()));
            }

            self.sink.publish(
                &Signal::new("ratelimiter.throttled")
                    .with_field("name", self.identity.name().to_string())
                    .with_field("rate", rate)
                    .with_field("tokens", 0.0)
                    .with_field("mode", if mode == Mode::Wait { "wait" } else { "drop" }),
            );

            match mode {
                Mode::Drop => {
                    return Err(Error::new(ErrorKind::RateLimited, RateLimitedCause, Some(input))
                        .with_prefixed_path(self.identity.clone()));
                }
                Mode::Wait => {
                    if rate <= 0.0 {
                        ctx.canceled().await;
                        return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                            .with_prefixed_path(self.identity.clone()));
                    }
                    let missing = {
                        let bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
                        (1.0 - bucket.tokens).max(0.0)
                    };
                    let wait = Duration::from_secs_f64(missing / rate);
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {}
                        _ = ctx.canceled() => {
                            return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                                .with_prefixed_path(self.identity.clone()));
                        }
                    }
                }
            }
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.child.close().await.map_err(|err| err.with_prefixed_path(self.identity.clone()))
    }

    fn schema(&self) -> SchemaNode {
        let bucket = self.bucket.lock().expect("rate limiter bucket lock poisoned");
        SchemaNode::leaf(self.identity.clone(), "rate_limiter")
            .with_metadata("rate", bucket.rate.to_string())
            .with_metadata("burst", bucket.burst.to_string())
            .with_metadata("mode", if bucket.mode == Mode::Wait { "wait" } else { "drop" })
            .with_children("child", vec![self.child.schema()])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("context canceled")]
struct CanceledCause;

#[derive(Debug, thiserror::Error)]
#[error("rate limit exceeded")]
struct RateLimitedCause;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;
    use crate::clock::TestClock;

    fn passthrough() -> BoxProcessor<i32> {
        Arc::new(Transform::new(Identity::new("passthrough"), |_ctx, x: i32| async move { x }))
    }

    #[tokio::test]
    async fn admits_up_to_burst_immediately() {
        let limiter = RateLimiter::new(Identity::new("limiter"), passthrough(), 10.0, 5.0).with_mode(Mode::Drop);

        for _ in 0..5 {
            limiter.process(&Context::new(), 1).await.unwrap();
        }
        let err = limiter.process(&Context::new(), 1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn drop_mode_returns_error_with_no_tokens() {
        let limiter = RateLimiter::new(Identity::new("limiter"), passthrough(), 0.0, 0.0).with_mode(Mode::Drop);
        let err = limiter.process(&Context::new(), 1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn wait_mode_unblocks_once_clock_advances() {
        let clock = Arc::new(TestClock::new());
        let limiter =
            RateLimiter::new(Identity::new("limiter"), passthrough(), 10.0, 1.0).with_clock(clock.clone());

        limiter.process(&Context::new(), 1).await.unwrap();

        let handle = tokio::spawn({
            let limiter = Arc::new(limiter);
            async move { limiter.process(&Context::new(), 2).await }
        });
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100)).await;

        let out = handle.await.unwrap().unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn set_rate_refills_before_changing() {
        let limiter = RateLimiter::new(Identity::new("limiter"), passthrough(), 1.0, 1.0).with_mode(Mode::Drop);
        limiter.process(&Context::new(), 1).await.unwrap();
        limiter.set_rate(1000.0);
        assert!(limiter.tokens() < 1.0);
    }
}
