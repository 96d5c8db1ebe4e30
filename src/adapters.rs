//! Leaf processors constructed from plain functions.
//!
//! See [`Transform`], [`Apply`], [`Effect`], [`Mutate`], and [`Enrich`] for
//! the five adapter flavors.

use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;
use crate::panic;
use crate::processor::Processor;
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A processor that applies `(ctx, T) -> T` and cannot fail (except via the
/// panic bridge).
pub struct Transform<T, F> {
    identity: Identity,
    f: F,
    _marker: std::marker::PhantomData<fn(T) -> T>,
}

impl<T, F, Fut> Transform<T, F>
where
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = T> + Send,
{
    /// Wraps `f` as a `Transform` adapter under `identity`.
    pub fn new(identity: Identity, f: F) -> Self {
        Transform {
            identity,
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> Processor<T> for Transform<T, F>
where
    T: Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = T> + Send,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        // `guard_async` already prepends this adapter's identity to a
        // caught panic's path, so no further prefixing is needed here.
        panic::guard_async(&self.identity, || None, (self.f)(ctx.clone(), input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "transform")
    }
}

/// A processor that applies `(ctx, T) -> Result<T, err>`, surfacing the
/// error.
pub struct Apply<T, F> {
    identity: Identity,
    f: F,
    _marker: std::marker::PhantomData<fn(T) -> T>,
}

impl<T, F, Fut, E> Apply<T, F>
where
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wraps `f` as an `Apply` adapter under `identity`.
    pub fn new(identity: Identity, f: F) -> Self {
        Apply {
            identity,
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, E> Processor<T> for Apply<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let identity = self.identity.clone();
        let original = input.clone();
        let result = panic::guard_async(&self.identity, || Some(original.clone()), (self.f)(ctx.clone(), input)).await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(Error::new(crate::error::ErrorKind::ProcessorFailure, cause, Some(original))
                .with_prefixed_path(identity)),
            // already carries this adapter's identity, attached by guard_async.
            Err(err) => Err(err),
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "apply")
    }
}

/// A processor that applies `(ctx, T) -> Result<(), err>` for its side
/// effect; the input passes through unchanged on success.
pub struct Effect<T, F> {
    identity: Identity,
    f: F,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T, F, Fut, E> Effect<T, F>
where
    F: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wraps `f` as an `Effect` adapter under `identity`.
    pub fn new(identity: Identity, f: F) -> Self {
        Effect {
            identity,
            f,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut, E> Processor<T> for Effect<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let identity = self.identity.clone();
        let original = input.clone();
        let result = panic::guard_async(&self.identity, || Some(original.clone()), (self.f)(ctx.clone(), &input)).await;

        match result {
            Ok(Ok(())) => Ok(input),
            Ok(Err(cause)) => Err(Error::new(crate::error::ErrorKind::ProcessorFailure, cause, Some(original))
                .with_prefixed_path(identity)),
            Err(err) => Err(err),
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "effect")
    }
}

/// A processor that conditionally transforms: a predicate decides whether
/// to run the transform; when false, the input passes through unchanged.
/// Never fails (except via the panic bridge).
pub struct Mutate<T, P, F> {
    identity: Identity,
    predicate: P,
    transform: F,
    _marker: std::marker::PhantomData<fn(T) -> T>,
}

impl<T, P, F, PFut, FFut> Mutate<T, P, F>
where
    P: Fn(Context, &T) -> PFut + Send + Sync,
    PFut: Future<Output = bool> + Send,
    F: Fn(Context, T) -> FFut + Send + Sync,
    FFut: Future<Output = T> + Send,
{
    /// Wraps `predicate` and `transform` as a `Mutate` adapter under
    /// `identity`.
    pub fn new(identity: Identity, predicate: P, transform: F) -> Self {
        Mutate {
            identity,
            predicate,
            transform,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<T, P, F, PFut, FFut> Processor<T> for Mutate<T, P, F>
where
    T: Send + 'static,
    P: Fn(Context, &T) -> PFut + Send + Sync,
    PFut: Future<Output = bool> + Send,
    F: Fn(Context, T) -> FFut + Send + Sync,
    FFut: Future<Output = T> + Send,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let should_run = (self.predicate)(ctx.clone(), &input).await;
        if !should_run {
            return Ok(input);
        }
        panic::guard_async(&self.identity, || None, (self.transform)(ctx.clone(), input)).await
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "mutate")
    }
}

/// A processor that applies `(ctx, T) -> Result<T, err>`, but treats
/// failure as best-effort: the enrichment error is signaled and logged, and
/// the original input is returned unchanged with no error.
pub struct Enrich<T, F> {
    identity: Identity,
    f: F,
    sink: Arc<dyn SignalSink>,
    _marker: std::marker::PhantomData<fn(T) -> T>,
}

impl<T, F, Fut, E> Enrich<T, F>
where
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wraps `f` as an `Enrich` adapter under `identity`, with no signal
    /// sink.
    pub fn new(identity: Identity, f: F) -> Self {
        Enrich {
            identity,
            f,
            sink: noop_sink(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Attaches a [`SignalSink`] that observes `"enrich.failed"` signals
    /// carrying the enrichment's error message.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl<T, F, Fut, E> Processor<T> for Enrich<T, F>
where
    T: Clone + Send + 'static,
    F: Fn(Context, T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let original = input.clone();
        let result = panic::guard_async(&self.identity, || Some(original.clone()), (self.f)(ctx.clone(), input)).await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => {
                tracing::warn!(processor = %self.identity, error = %cause, "enrichment failed, passing input through");
                self.sink.publish(
                    &Signal::new("enrich.failed")
                        .with_field("name", self.identity.name().to_string())
                        .with_field("error", cause.to_string()),
                );
                Ok(original)
            }
            Err(panicked) => {
                tracing::warn!(processor = %self.identity, "enrichment panicked, passing input through");
                self.sink.publish(
                    &Signal::new("enrich.failed")
                        .with_field("name", self.identity.name().to_string())
                        .with_field("error", panicked.to_string()),
                );
                Ok(original)
            }
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn schema(&self) -> SchemaNode {
        SchemaNode::leaf(self.identity.clone(), "enrich")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transform_applies_function() {
        let identity = Identity::new("double");
        let p = Transform::new(identity, |_ctx, x: i32| async move { x * 2 });
        let out = p.process(&Context::new(), 21).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn mutate_passes_through_when_predicate_false() {
        let identity = Identity::new("maybe-increment");
        let p = Mutate::new(
            identity,
            |_ctx, x: &i32| {
                let cond = *x > 100;
                async move { cond }
            },
            |_ctx, x: i32| async move { x + 1 },
        );
        let out = p.process(&Context::new(), 5).await.unwrap();
        assert_eq!(out, 5);
    }

    #[tokio::test]
    async fn enrich_recovers_from_failure() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let identity = Identity::new("enrich-fail");
        let p = Enrich::new(identity, |_ctx, _x: i32| async move { Err::<i32, Boom>(Boom) });
        let out = p.process(&Context::new(), 7).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn transform_catches_panics() {
        let identity = Identity::new("panicker");
        let p = Transform::new(identity, |_ctx, _x: i32| async move {
            panic!("nope");
            #[allow(unreachable_code)]
            0
        });
        let err = p.process(&Context::new(), 1).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Panic(_)));
    }
}
