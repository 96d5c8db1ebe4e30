//! Deadline enforcement over a single child.
//!
//! See [`Timeout`] for more details.

use crate::clock::{real_clock, Clock};
use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Derives a child [`Context`] with a deadline `duration` from now, invokes
/// the child, and races it against that deadline. If the deadline fires
/// first, returns a structured error with `timeout = true`; the child's
/// context is canceled so it can stop promptly.
///
/// The deadline is measured by an injectable [`Clock`]; the real clock is
/// the default.
pub struct Timeout<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    duration: Duration,
    clock: Arc<dyn Clock>,
    close_once: CloseOnce,
}

impl<T> Timeout<T>
where
    T: Send + 'static,
{
    /// Wraps `child`, bounding each invocation to `duration`.
    pub fn new(identity: Identity, child: BoxProcessor<T>, duration: Duration) -> Self {
        Timeout {
            identity,
            child,
            duration,
            clock: real_clock(),
            close_once: CloseOnce::new(),
        }
    }

    /// Replaces the clock used to measure the deadline.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<T> Processor<T> for Timeout<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let deadline = self.clock.now() + self.duration;
        let child_ctx = ctx.child_with_deadline(deadline);

        tokio::select! {
            biased;
            result = self.child.process(&child_ctx, input) => {
                result.map_err(|err| err.with_prefixed_path(self.identity.clone()))
            }
            _ = self.clock.sleep(self.duration) => {
                child_ctx.cancel();
                Err(Error::new(ErrorKind::Timeout, TimeoutCause(self.duration), None)
                    .with_prefixed_path(self.identity.clone()))
            }
        }
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
        SchemaNode::leaf(self.identity.clone(), "timeout")
            .with_metadata("duration_ms", self.duration.as_millis().to_string())
            .with_children("child", vec![self.child.schema()])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("deadline of {0:?} exceeded")]
struct TimeoutCause(Duration);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;
    use crate::clock::TestClock;

    #[tokio::test(start_paused = true)]
    async fn returns_child_result_when_it_completes_first() {
        let child: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("fast"), |_ctx, x: i32| async move { x + 1 }));
        let timeout = Timeout::new(Identity::new("timeout"), child, Duration::from_secs(10));
        let out = timeout.process(&Context::new(), 1).await.unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn fires_timeout_when_child_never_completes() {
        let clock = Arc::new(TestClock::new());
        let child: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("slow"), |ctx, x: i32| async move {
            ctx.canceled().await;
            x
        }));
        let timeout = Timeout::new(Identity::new("timeout"), child, Duration::from_millis(50)).with_clock(clock.clone());

        let handle = tokio::spawn(async move { timeout.process(&Context::new(), 1).await });
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50)).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
    }
}
