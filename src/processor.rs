//! The uniform capability every leaf adapter and connector implements.
//!
//! See [`Processor`] for more details.

use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;
use crate::schema::SchemaNode;
use async_trait::async_trait;
use std::sync::Arc;

/// The single capability the kernel is polymorphic over: given a
/// cancellation [`Context`] and an input of type `T`, produce either a
/// transformed `T` or a structured [`Error<T>`].
///
/// Both leaf adapters (built from plain functions, see [`crate::adapters`])
/// and structural connectors (which nest other `Processor`s) implement this
/// trait uniformly, which is what lets connectors compose arbitrarily.
#[async_trait]
pub trait Processor<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Consumes `input` under `ctx`, returning the transformed value or a
    /// structured error whose `path` is prepended with this processor's
    /// identity.
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>>;

    /// This processor's stable identity.
    fn identity(&self) -> &Identity;

    /// Releases any resources held by this processor and, for structural
    /// connectors, recursively closes children in reverse registration
    /// order. Idempotent: a second call is a no-op returning `Ok(())`.
    async fn close(&self) -> Result<(), Error<()>> {
        Ok(())
    }

    /// A read-only structural snapshot of this processor, for external
    /// introspection tooling.
    fn schema(&self) -> SchemaNode;
}

/// A type-erased, shareable [`Processor`], the shape every connector stores
/// its children as.
pub type BoxProcessor<T> = Arc<dyn Processor<T>>;

#[async_trait]
impl<T> Processor<T> for BoxProcessor<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        self.as_ref().process(ctx, input).await
    }

    fn identity(&self) -> &Identity {
        self.as_ref().identity()
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.as_ref().close().await
    }

    fn schema(&self) -> SchemaNode {
        self.as_ref().schema()
    }
}
