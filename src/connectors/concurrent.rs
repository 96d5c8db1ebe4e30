//! Fan-out with wait-all and an optional reducer.
//!
//! See [`Concurrent`] for more details.

use crate::clone::Cloneable;
use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::Error;
use crate::hooks::Hooks;
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Combines a fan-out's original input, its per-child successes, and its
/// per-child errors (both keyed by child [`Identity`], never by position)
/// into a single result.
pub type Reducer<T> = Arc<dyn Fn(T, HashMap<Identity, T>, HashMap<Identity, Error<T>>) -> T + Send + Sync>;

/// Fired once a [`Concurrent`] fan-out's wait loop ends, whether by every
/// child finishing or by the caller's context firing early.
#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub identity: Identity,
    pub success_count: usize,
    pub error_count: usize,
    pub duration: Duration,
    pub released_early: bool,
}

/// Fan-out with wait-all semantics over N children, requiring the
/// [`Cloneable`] contract on `T`.
///
/// Each child runs in its own spawned task against a clone of the input and,
/// by default, a detached context: the caller's values are preserved but
/// cancellation is independent, so ending the caller's context does not stop
/// children already in flight. Context cancellation during the wait releases
/// the waiter early without force-aborting in-flight children — they keep
/// running to completion in the background — unless
/// [`with_cancel_children`](Self::with_cancel_children) opts into deriving a
/// child context from the caller's, sharing its cancellation lineage.
///
/// With no reducer, `Process` returns the original input unchanged (every
/// child ran purely for its side effects). With a reducer, it invokes
/// `reducer(original, successes, errors)` once the wait loop ends.
pub struct Concurrent<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    reducer: Option<Reducer<T>>,
    cancel_children: bool,
    sink: Arc<dyn SignalSink>,
    hooks: Hooks<CompletedEvent>,
    close_once: CloseOnce,
}

impl<T> Concurrent<T>
where
    T: Cloneable + Send + 'static,
{
    /// Returns a new `Concurrent` over `children` with no reducer: every
    /// child runs for its side effects and the original input is returned.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>) -> Self {
        Concurrent {
            identity,
            children: RwLock::new(children),
            reducer: None,
            cancel_children: false,
            sink: noop_sink(),
            hooks: Hooks::new(),
            close_once: CloseOnce::new(),
        }
    }

    /// Attaches a reducer combining the original input with every child's
    /// outcome into the final result.
    #[must_use]
    pub fn with_reducer(mut self, reducer: Reducer<T>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    /// Opts into propagating the caller's cancellation down to children
    /// (the default keeps children running independent of caller
    /// cancellation; only the waiter is released early).
    #[must_use]
    pub fn with_cancel_children(mut self, cancel_children: bool) -> Self {
        self.cancel_children = cancel_children;
        self
    }

    /// Attaches a [`SignalSink`] that observes `"concurrent.completed"`
    /// signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The hook registry for [`CompletedEvent`]s.
    pub fn hooks(&self) -> &Hooks<CompletedEvent> {
        &self.hooks
    }

    /// Appends a child to the fan-out.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T> Processor<T> for Concurrent<T>
where
    T: Cloneable + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let snapshot = self.children.read().await.clone();
        let original = input.clone_isolated();
        let start = Instant::now();

        let mut tasks = FuturesUnordered::new();
        for child in snapshot.iter() {
            let child = Arc::clone(child);
            let child_input = input.clone_isolated();
            let child_ctx = if self.cancel_children { ctx.child() } else { ctx.detached() };
            tasks.push(tokio::spawn(async move {
                let identity = child.identity().clone();
                let result = child.process(&child_ctx, child_input).await;
                (identity, result)
            }));
        }

        let mut successes = HashMap::new();
        let mut errors = HashMap::new();
        let mut released_early = false;

        loop {
            if tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                next = tasks.next() => {
                    match next {
                        Some(Ok((identity, Ok(value)))) => { successes.insert(identity, value); }
                        Some(Ok((identity, Err(err)))) => { errors.insert(identity, err); }
                        Some(Err(join_err)) => {
                            tracing::error!(processor = %self.identity, error = %join_err, "concurrent child task failed to join");
                        }
                        None => break,
                    }
                }
                _ = ctx.canceled() => {
                    released_early = true;
                    break;
                }
            }
        }

        let duration = start.elapsed();
        self.sink.publish(
            &Signal::new("concurrent.completed")
                .with_field("name", self.identity.name().to_string())
                .with_field("successes", successes.len() as i64)
                .with_field("errors", errors.len() as i64)
                .with_field("duration", duration),
        );
        self.hooks.fire(CompletedEvent {
            identity: self.identity.clone(),
            success_count: successes.len(),
            error_count: errors.len(),
            duration,
            released_early,
        });

        match &self.reducer {
            Some(reducer) => Ok(reducer(original, successes, errors)),
            None => Ok(original),
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.close_once
            .run(async {
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
            })
            .await
    }

    fn schema(&self) -> SchemaNode {
        let snapshot = self
            .children
            .try_read()
            .map(|guard| guard.iter().map(|c| c.schema()).collect::<Vec<_>>())
            .unwrap_or_default();
        SchemaNode::leaf(self.identity.clone(), "concurrent")
            .with_metadata("has_reducer", self.reducer.is_some().to_string())
            .with_children("children", snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;

    fn doubling(name: &str) -> BoxProcessor<i32> {
        Arc::new(Transform::new(Identity::new(name), |_ctx, x: i32| async move { x * 2 }))
    }

    #[tokio::test]
    async fn no_reducer_returns_original_input() {
        let concurrent = Concurrent::new(Identity::new("fan-out"), vec![doubling("a"), doubling("b")]);
        let out = concurrent.process(&Context::new(), 5).await.unwrap();
        assert_eq!(out, 5);
    }

    #[tokio::test]
    async fn reducer_sums_original_and_successes() {
        fn delta(name: &str, delta: i32) -> BoxProcessor<i32> {
            Arc::new(Transform::new(Identity::new(name), move |_ctx, x: i32| async move { x + delta }))
        }

        let reducer: Reducer<i32> = Arc::new(|original, successes, _errors| original + successes.values().sum::<i32>());
        let concurrent = Concurrent::new(Identity::new("fan-out"), vec![delta("a", 10), delta("b", 20), delta("c", 30)])
            .with_reducer(reducer);

        let out = concurrent.process(&Context::new(), 5).await.unwrap();
        assert_eq!(out, 5 + 15 + 25 + 35);
    }

    #[tokio::test]
    async fn panicking_child_is_recorded_as_error_without_deadlocking() {
        use crate::adapters::Transform as T;

        let panicker: BoxProcessor<i32> = Arc::new(T::new(Identity::new("panics"), |_ctx, _x: i32| async move {
            panic!("kaboom")
        }));
        let reducer: Reducer<i32> = Arc::new(|original, successes, errors| original + successes.len() as i32 - errors.len() as i32);
        let concurrent = Concurrent::new(Identity::new("fan-out"), vec![doubling("ok"), panicker]).with_reducer(reducer);

        let out = concurrent.process(&Context::new(), 1).await.unwrap();
        assert_eq!(out, 1 + 1 - 1);
    }
}
