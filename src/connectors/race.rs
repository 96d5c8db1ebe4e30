//! First-to-satisfy-condition winner selection: [`Race`] and [`Contest`].

use crate::clone::Cloneable;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Fans out to N children and returns the first to succeed; every other
/// child's context is canceled before `Process` returns. If every child
/// fails, returns an aggregated error.
///
/// Requires the [`Cloneable`] contract on `T`. Loser completion order is
/// unobservable, and every loser's cancellation is guaranteed to fire
/// before `Process` returns — no detached stragglers beyond a bounded
/// shutdown.
pub struct Race<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
}

impl<T> Race<T>
where
    T: Cloneable + Send + 'static,
{
    /// Returns a new `Race` over `children`.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>) -> Self {
        Race {
            identity,
            children: RwLock::new(children),
        }
    }

    /// Appends a child to the race.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T> Processor<T> for Race<T>
where
    T: Cloneable + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        run_race(&self.identity, &self.children, ctx, input, RaceKind::Race, |_value: &T| async { true }).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        close_children(&self.identity, &self.children).await
    }

    fn schema(&self) -> SchemaNode {
        schema_of(&self.identity, "race", &self.children)
    }
}

/// [`Race`]'s gated specialization: an additional predicate
/// `(ctx, T) -> bool` decides whether a given success counts as the winner.
/// Children whose results fail the predicate are ignored and the race
/// continues; if every child completes without a satisfying result,
/// `Process` returns a structured error.
pub struct Contest<T, P> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    predicate: P,
}

impl<T, P, Fut> Contest<T, P>
where
    T: Cloneable + Send + 'static,
    P: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Returns a new `Contest` over `children`, gated by `predicate`.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>, predicate: P) -> Self {
        Contest {
            identity,
            children: RwLock::new(children),
            predicate,
        }
    }

    /// Appends a child to the contest.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T, P, Fut> Processor<T> for Contest<T, P>
where
    T: Cloneable + Send + 'static,
    P: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        run_race(&self.identity, &self.children, ctx, input, RaceKind::Contest, |value: &T| {
            (self.predicate)(ctx.clone(), value)
        })
        .await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        close_children(&self.identity, &self.children).await
    }

    fn schema(&self) -> SchemaNode {
        schema_of(&self.identity, "contest", &self.children)
    }
}

/// Distinguishes [`Race`]'s exhaustion error (every child failed outright)
/// from [`Contest`]'s (every child completed, but none satisfied the
/// predicate) even though both share the same fan-out machinery.
enum RaceKind {
    Race,
    Contest,
}

/// Runs the shared race/contest fan-out: spawns a task per child against an
/// independently-cancelable context, returns the first success for which
/// `satisfies` holds, and cancels every other child's context before
/// returning.
async fn run_race<T, S, Fut>(
    identity: &Identity,
    children: &RwLock<Vec<BoxProcessor<T>>>,
    ctx: &Context,
    input: T,
    kind: RaceKind,
    satisfies: S,
) -> Result<T, Error<T>>
where
    T: Cloneable + Send + 'static,
    S: Fn(&T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    let snapshot = children.read().await.clone();
    if snapshot.is_empty() {
        return Ok(input);
    }

    let mut competitor_ctxs = Vec::with_capacity(snapshot.len());
    let mut tasks = FuturesUnordered::new();

    for child in snapshot.iter() {
        let child = Arc::clone(child);
        let child_input = input.clone_isolated();
        let child_ctx = ctx.child();
        competitor_ctxs.push(child_ctx.clone());
        tasks.push(tokio::spawn(async move { child.process(&child_ctx, child_input).await }));
    }

    let mut last_err = None;

    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(Ok(value)) => {
                if satisfies(&value).await {
                    for token in &competitor_ctxs {
                        token.cancel();
                    }
                    return Ok(value);
                }
            }
            Ok(Err(err)) => last_err = Some(err),
            Err(join_err) => {
                tracing::error!(processor = %identity, error = %join_err, "race child task failed to join");
            }
        }
    }

    for token in &competitor_ctxs {
        token.cancel();
    }

    let duration = last_err.as_ref().map(Error::duration).unwrap_or_default();
    let err = match (kind, last_err) {
        // Race: every child returned an error; surface the last one's actual
        // cause, the same aggregation shape Fallback uses on exhaustion.
        (RaceKind::Race, Some(err)) => {
            Error::new(ErrorKind::AllAlternativesFailed, err.into_cause(), Some(input))
        }
        (RaceKind::Race, None) => Error::new(ErrorKind::AllAlternativesFailed, NoSatisfyingResult, Some(input)),
        // Contest: children may well have succeeded, just not satisfyingly;
        // there's no child cause to surface.
        (RaceKind::Contest, _) => Error::new(ErrorKind::NoSatisfyingResult, NoSatisfyingResult, Some(input)),
    };
    Err(err.with_prefixed_path(identity.clone()).with_duration(duration))
}

async fn close_children<T>(identity: &Identity, children: &RwLock<Vec<BoxProcessor<T>>>) -> Result<(), Error<()>>
where
    T: Send + 'static,
{
    let snapshot = children.read().await.clone();
    let mut first_err = None;
    for child in snapshot.iter().rev() {
        if let Err(err) = child.close().await {
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err.with_prefixed_path(identity.clone())),
        None => Ok(()),
    }
}

fn schema_of<T>(identity: &Identity, kind: &'static str, children: &RwLock<Vec<BoxProcessor<T>>>) -> SchemaNode
where
    T: Send + 'static,
{
    let snapshot = children
        .try_read()
        .map(|guard| guard.iter().map(|c| c.schema()).collect::<Vec<_>>())
        .unwrap_or_default();
    SchemaNode::leaf(identity.clone(), kind).with_children("children", snapshot)
}

#[derive(Debug, thiserror::Error)]
#[error("no child result satisfied the contest predicate")]
struct NoSatisfyingResult;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;
    use std::time::Duration;

    fn immediate(name: &str, value: i32) -> BoxProcessor<i32> {
        Arc::new(Transform::new(Identity::new(name), move |_ctx, _x: i32| async move { value }))
    }

    fn delayed(name: &str, value: i32, delay: Duration) -> BoxProcessor<i32> {
        Arc::new(Transform::new(Identity::new(name), move |_ctx, _x: i32| async move {
            tokio::time::sleep(delay).await;
            value
        }))
    }

    #[tokio::test]
    async fn race_returns_first_success() {
        let race = Race::new(
            Identity::new("race"),
            vec![delayed("slow", 1, Duration::from_millis(50)), immediate("fast", 2)],
        );
        let out = race.process(&Context::new(), 0).await.unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn contest_skips_non_satisfying_results() {
        let contest = Contest::new(
            Identity::new("contest"),
            vec![immediate("too-small", 1), delayed("big-enough", 100, Duration::from_millis(10))],
            |_ctx, x: &i32| {
                let ok = *x >= 10;
                async move { ok }
            },
        );
        let out = contest.process(&Context::new(), 0).await.unwrap();
        assert_eq!(out, 100);
    }

    #[tokio::test]
    async fn race_aggregates_when_all_children_fail() {
        use crate::adapters::Apply;

        #[derive(Debug, thiserror::Error)]
        #[error("race leg failed")]
        struct LegFailed;

        let race: Race<i32> = Race::new(
            Identity::new("race"),
            vec![
                Arc::new(Apply::new(Identity::new("a"), |_ctx, _x: i32| async move { Err::<i32, LegFailed>(LegFailed) })),
                Arc::new(Apply::new(Identity::new("b"), |_ctx, _x: i32| async move { Err::<i32, LegFailed>(LegFailed) })),
            ],
        );
        let err = race.process(&Context::new(), 0).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AllAlternativesFailed));
        assert!(err.cause().to_string().contains("race leg failed"));
    }

    #[tokio::test]
    async fn contest_fails_when_none_satisfy() {
        let contest = Contest::new(
            Identity::new("contest"),
            vec![immediate("a", 1), immediate("b", 2)],
            |_ctx, _x: &i32| async move { false },
        );
        let err = contest.process(&Context::new(), 0).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NoSatisfyingResult));
    }
}
