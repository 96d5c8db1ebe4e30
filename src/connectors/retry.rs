//! Attempt-based recovery: [`Retry`] (no delay) and [`Backoff`] (exponential
//! delay).

use crate::clock::{real_clock, Clock};
use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Re-invokes a child up to `max_attempts` times on failure, with no delay
/// between attempts. Honors context cancellation between attempts. On
/// exhaustion, returns the last error with this `Retry`'s identity
/// prepended.
pub struct Retry<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    max_attempts: u32,
    sink: Arc<dyn SignalSink>,
    close_once: CloseOnce,
}

impl<T> Retry<T>
where
    T: Clone + Send + 'static,
{
    /// Wraps `child`, retrying up to `max_attempts` times (clamped to at
    /// least 1).
    pub fn new(identity: Identity, child: BoxProcessor<T>, max_attempts: u32) -> Self {
        Retry {
            identity,
            child,
            max_attempts: max_attempts.max(1),
            sink: noop_sink(),
            close_once: CloseOnce::new(),
        }
    }

    /// Attaches a [`SignalSink`] that observes `"retry.exhausted"` signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl<T> Processor<T> for Retry<T>
where
    T: Clone + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            if ctx.is_canceled() {
                return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                    .with_prefixed_path(self.identity.clone()));
            }
            match self.child.process(ctx, input.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(processor = %self.identity, attempt, error = %err, "retry attempt failed");
                    last_err = Some(err);
                }
            }
        }
        self.sink.publish(
            &Signal::new("retry.exhausted")
                .with_field("name", self.identity.name().to_string())
                .with_field("attempt", self.max_attempts),
        );
        Err(exhausted(&self.identity, last_err, input))
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.close_once
            .run(async { self.child.close().await.map_err(|err| err.with_prefixed_path(self.identity.clone())) })
            .await
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "retry")
            .with_metadata("max_attempts", self.max_attempts.to_string())
            .with_children("child", vec![self.child.schema()])
    }
}

/// Like [`Retry`], but multiplies `base_delay` by 2 per attempt between
/// tries (exponential backoff). Waits are raced against context
/// cancellation and use an injectable [`Clock`] for test determinism.
pub struct Backoff<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    max_attempts: u32,
    base_delay: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SignalSink>,
    close_once: CloseOnce,
}

impl<T> Backoff<T>
where
    T: Clone + Send + 'static,
{
    /// Wraps `child`, retrying up to `max_attempts` times (clamped to at
    /// least 1), waiting `base_delay * 2^(attempt-1)` between tries.
    pub fn new(identity: Identity, child: BoxProcessor<T>, max_attempts: u32, base_delay: Duration) -> Self {
        Backoff {
            identity,
            child,
            max_attempts: max_attempts.max(1),
            base_delay,
            clock: real_clock(),
            sink: noop_sink(),
            close_once: CloseOnce::new(),
        }
    }

    /// Replaces the clock used for backoff waits.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches a [`SignalSink`] that observes `"retry.exhausted"` signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1 << attempt.saturating_sub(1).min(30))
    }
}

#[async_trait]
impl<T> Processor<T> for Backoff<T>
where
    T: Clone + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            if ctx.is_canceled() {
                return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                    .with_prefixed_path(self.identity.clone()));
            }
            match self.child.process(ctx, input.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(processor = %self.identity, attempt, error = %err, "retry attempt failed");
                    last_err = Some(err);
                }
            }

            if attempt < self.max_attempts {
                let delay = self.delay_for(attempt);
                tokio::select! {
                    _ = self.clock.sleep(delay) => {}
                    _ = ctx.canceled() => {
                        return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                            .with_prefixed_path(self.identity.clone()));
                    }
                }
            }
        }
        self.sink.publish(
            &Signal::new("retry.exhausted")
                .with_field("name", self.identity.name().to_string())
                .with_field("attempt", self.max_attempts),
        );
        Err(exhausted(&self.identity, last_err, input))
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.close_once
            .run(async { self.child.close().await.map_err(|err| err.with_prefixed_path(self.identity.clone())) })
            .await
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "backoff")
            .with_metadata("max_attempts", self.max_attempts.to_string())
            .with_metadata("base_delay_ms", self.base_delay.as_millis().to_string())
            .with_children("child", vec![self.child.schema()])
    }
}

fn exhausted<T>(identity: &Identity, last_err: Option<Error<T>>, input: T) -> Error<T> {
    match last_err {
        Some(err) => {
            let duration = err.duration();
            Error::new(ErrorKind::RetriesExhausted, err.into_cause(), Some(input))
                .with_duration(duration)
                .with_prefixed_path(identity.clone())
        }
        None => Error::new(ErrorKind::RetriesExhausted, RetriesExhaustedCause, Some(input))
            .with_prefixed_path(identity.clone()),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("context canceled")]
struct CanceledCause;

#[derive(Debug, thiserror::Error)]
#[error("retries exhausted")]
struct RetriesExhaustedCause;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Apply;
    use crate::clock::TestClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("transient")]
    struct Transient;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let child: BoxProcessor<i32> = Arc::new(Apply::new(Identity::new("flaky"), move |_ctx, x: i32| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Transient)
                } else {
                    Ok(x)
                }
            }
        }));
        let retry = Retry::new(Identity::new("retry"), child, 5);
        let out = retry.process(&Context::new(), 9).await.unwrap();
        assert_eq!(out, 9);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_after_max_attempts() {
        let child: BoxProcessor<i32> =
            Arc::new(Apply::new(Identity::new("always-fails"), |_ctx, _x: i32| async move { Err::<i32, Transient>(Transient) }));
        let retry = Retry::new(Identity::new("retry"), child, 3);
        let err = retry.process(&Context::new(), 1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RetriesExhausted));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_grow_exponentially() {
        let clock = Arc::new(TestClock::new());
        let child: BoxProcessor<i32> =
            Arc::new(Apply::new(Identity::new("always-fails"), |_ctx, _x: i32| async move { Err::<i32, Transient>(Transient) }));
        let backoff = Backoff::new(Identity::new("backoff"), child, 3, Duration::from_millis(10)).with_clock(clock.clone());

        let handle = tokio::spawn(async move { backoff.process(&Context::new(), 1).await });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(20)).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RetriesExhausted));
    }
}
