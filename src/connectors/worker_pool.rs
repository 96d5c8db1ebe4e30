//! Bounded-parallel fan-out via a semaphore.
//!
//! See [`WorkerPool`] for more details.

use crate::clock::{real_clock, Clock};
use crate::clone::Cloneable;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};

/// Fans out to N children, admitting at most `worker_count` of them to run
/// concurrently via a [`Semaphore`]. Waits for every child to complete; on
/// any child error, the first one observed is surfaced (others still run to
/// completion or cancellation). Requires the [`Cloneable`] contract on `T`
/// and returns the original input unchanged, like [`Concurrent`][concurrent].
///
/// An optional per-child timeout, measured by an injectable [`Clock`], bounds
/// how long a single child may hold its worker slot; `None` (the default)
/// applies no bound.
///
/// [concurrent]: crate::connectors::concurrent::Concurrent
pub struct WorkerPool<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    worker_count: usize,
    semaphore: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
    child_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SignalSink>,
}

impl<T> WorkerPool<T>
where
    T: Cloneable + Send + 'static,
{
    /// Returns a new `WorkerPool` over `children`, admitting at most
    /// `worker_count` at once. A non-positive count is clamped to 1.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        WorkerPool {
            identity,
            children: RwLock::new(children),
            worker_count,
            semaphore: Arc::new(Semaphore::new(worker_count)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            child_timeout: None,
            clock: real_clock(),
            sink: noop_sink(),
        }
    }

    /// Bounds each child invocation to `duration`, measured by this pool's
    /// clock; exceeding it surfaces a `Timeout` error for that child.
    #[must_use]
    pub fn with_child_timeout(mut self, duration: Duration) -> Self {
        self.child_timeout = Some(duration);
        self
    }

    /// Replaces the clock used for per-child timeouts. Passing `None`
    /// reverts to the real clock, matching the spec's "nil falls back to
    /// real clock" rule.
    #[must_use]
    pub fn with_clock(mut self, clock: Option<Arc<dyn Clock>>) -> Self {
        self.clock = clock.unwrap_or_else(real_clock);
        self
    }

    /// Attaches a [`SignalSink`] that observes `"workerpool.saturated"`,
    /// `"workerpool.acquired"`, and `"workerpool.released"` signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The configured worker count.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Appends a child to the pool.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T> Processor<T> for WorkerPool<T>
where
    T: Cloneable + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let snapshot = self.children.read().await.clone();
        let original = input.clone_isolated();

        if self.semaphore.available_permits() == 0 && !snapshot.is_empty() {
            self.sink.publish(
                &Signal::new("workerpool.saturated")
                    .with_field("name", self.identity.name().to_string())
                    .with_field("worker_count", self.worker_count as i64),
            );
        }

        let mut tasks = FuturesUnordered::new();
        for child in snapshot.iter() {
            let child = Arc::clone(child);
            let child_input = input.clone_isolated();
            let child_ctx = ctx.clone();
            let semaphore = Arc::clone(&self.semaphore);
            let active_workers = Arc::clone(&self.active_workers);
            let sink = Arc::clone(&self.sink);
            let clock = Arc::clone(&self.clock);
            let timeout = self.child_timeout;
            let child_identity = child.identity().clone();
            let processor_name = self.identity.name().to_string();

            tasks.push(tokio::spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return None,
                };
                let active = active_workers.fetch_add(1, Ordering::SeqCst) + 1;
                sink.publish(
                    &Signal::new("workerpool.acquired")
                        .with_field("name", processor_name.clone())
                        .with_field("active_workers", active as i64),
                );

                let result = match timeout {
                    Some(duration) => {
                        tokio::select! {
                            biased;
                            result = child.process(&child_ctx, child_input) => result,
                            _ = clock.sleep(duration) => {
                                Err(Error::new(ErrorKind::Timeout, ChildTimedOut(duration), None)
                                    .with_prefixed_path(child_identity))
                            }
                        }
                    }
                    None => child.process(&child_ctx, child_input).await,
                };

                let active = active_workers.fetch_sub(1, Ordering::SeqCst) - 1;
                sink.publish(
                    &Signal::new("workerpool.released")
                        .with_field("name", processor_name)
                        .with_field("active_workers", active as i64),
                );
                drop(permit);
                Some(result)
            }));
        }

        let mut first_err = None;
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(Some(Err(err))) if first_err.is_none() => first_err = Some(err),
                Ok(_) => {}
                Err(join_err) => {
                    tracing::error!(processor = %self.identity, error = %join_err, "worker pool child task failed to join");
                }
            }
        }

        match first_err {
            Some(err) => Err(err.with_prefixed_path(self.identity.clone())),
            None => Ok(original),
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        let snapshot = self.children.read().await.clone();
        let mut first_err = None;
        for child in snapshot.iter().rev() {
            if let Err(err) = child.close().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.with_prefixed_path(self.identity.clone())),
            None => Ok(()),
        }
    }

    fn schema(&self) -> SchemaNode {
        let snapshot = self
            .children
            .try_read()
            .map(|guard| guard.iter().map(|c| c.schema()).collect::<Vec<_>>())
            .unwrap_or_default();
        SchemaNode::leaf(self.identity.clone(), "worker_pool")
            .with_metadata("worker_count", self.worker_count.to_string())
            .with_children("children", snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("child exceeded its {0:?} timeout")]
struct ChildTimedOut(Duration);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Apply, Transform};
    use crate::clock::TestClock;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[tokio::test]
    async fn worker_count_clamps_to_one() {
        let pool: WorkerPool<i32> = WorkerPool::new(Identity::new("pool"), vec![], 0);
        assert_eq!(pool.worker_count(), 1);
    }

    #[tokio::test]
    async fn runs_every_child_and_returns_original_input() {
        let children: Vec<BoxProcessor<i32>> = (0..5)
            .map(|i| -> BoxProcessor<i32> {
                Arc::new(Transform::new(Identity::new(format!("child-{i}")), |_ctx, x: i32| async move { x + 1 }))
            })
            .collect();
        let pool = WorkerPool::new(Identity::new("pool"), children, 2);
        let out = pool.process(&Context::new(), 7).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn never_admits_more_than_worker_count_concurrently() {
        let concurrent = Arc::new(StdAtomicUsize::new(0));
        let max_seen = Arc::new(StdAtomicUsize::new(0));

        let children: Vec<BoxProcessor<i32>> = (0..6)
            .map(|_| -> BoxProcessor<i32> {
                let concurrent = Arc::clone(&concurrent);
                let max_seen = Arc::clone(&max_seen);
                Arc::new(Transform::new(Identity::new("slow"), move |_ctx, x: i32| {
                    let concurrent = Arc::clone(&concurrent);
                    let max_seen = Arc::clone(&max_seen);
                    async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        x
                    }
                }))
            })
            .collect();

        let pool = WorkerPool::new(Identity::new("pool"), children, 2);
        pool.process(&Context::new(), 0).await.unwrap();
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn surfaces_first_child_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let children: Vec<BoxProcessor<i32>> = vec![
            Arc::new(Apply::new(Identity::new("fails"), |_ctx, _x: i32| async move { Err::<i32, Boom>(Boom) })),
            Arc::new(Transform::new(Identity::new("ok"), |_ctx, x: i32| async move { x })),
        ];
        let pool = WorkerPool::new(Identity::new("pool"), children, 2);
        let err = pool.process(&Context::new(), 0).await.unwrap_err();
        assert_eq!(err.path().last().map(|i| i.name()), Some("fails"));
    }

    #[tokio::test]
    async fn child_exceeding_timeout_is_reported_as_timeout_error() {
        let clock = Arc::new(TestClock::new());
        let never_finishes: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("stuck"), |ctx, x: i32| async move {
            ctx.canceled().await;
            x
        }));
        let pool = WorkerPool::new(Identity::new("pool"), vec![never_finishes], 1)
            .with_child_timeout(Duration::from_millis(50))
            .with_clock(Some(clock.clone()));

        let handle = tokio::spawn(async move { pool.process(&Context::new(), 1).await });
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50)).await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
    }
}
