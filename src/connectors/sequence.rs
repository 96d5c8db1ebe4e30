//! Ordered, fail-fast, dynamically editable chain of processors.
//!
//! See [`Sequence`] for more details.

use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// An ordered chain of children: `Process` feeds each child's output to the
/// next, stopping at the first failure.
///
/// The child list is guarded by a [`tokio::sync::RwLock`]: `process` takes a
/// snapshot under a read lock before running, so concurrent mutation never
/// tears an in-flight invocation.
pub struct Sequence<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    close_once: CloseOnce,
}

impl<T> Sequence<T>
where
    T: Send + 'static,
{
    /// Returns a new, empty `Sequence`.
    pub fn new(identity: Identity) -> Self {
        Sequence {
            identity,
            children: RwLock::new(Vec::new()),
            close_once: CloseOnce::new(),
        }
    }

    /// Returns a new `Sequence` seeded with `children`, in order.
    pub fn with_children(identity: Identity, children: Vec<BoxProcessor<T>>) -> Self {
        Sequence {
            identity,
            children: RwLock::new(children),
            close_once: CloseOnce::new(),
        }
    }

    /// Appends `child` to the end of the chain.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }

    /// Prepends `child` to the start of the chain.
    pub async fn unshift(&self, child: BoxProcessor<T>) {
        self.children.write().await.insert(0, child);
    }

    /// Removes and returns the last child, if any.
    pub async fn pop(&self) -> Result<BoxProcessor<T>, Error<()>> {
        self.children
            .write()
            .await
            .pop()
            .ok_or_else(|| self.empty_container_error())
    }

    /// Removes and returns the first child, if any.
    pub async fn shift(&self) -> Result<BoxProcessor<T>, Error<()>> {
        let mut children = self.children.write().await;
        if children.is_empty() {
            return Err(self.empty_container_error());
        }
        Ok(children.remove(0))
    }

    /// Replaces the child at `index`.
    pub async fn replace(&self, index: usize, child: BoxProcessor<T>) -> Result<(), Error<()>> {
        let mut children = self.children.write().await;
        let slot = children.get_mut(index).ok_or_else(|| self.out_of_bounds_error())?;
        *slot = child;
        Ok(())
    }

    /// Removes the child at `index`.
    pub async fn remove(&self, index: usize) -> Result<BoxProcessor<T>, Error<()>> {
        let mut children = self.children.write().await;
        if index >= children.len() {
            return Err(self.out_of_bounds_error());
        }
        Ok(children.remove(index))
    }

    /// Inserts `child` directly before the first child whose identity equals
    /// `before`.
    pub async fn insert_before(&self, before: &Identity, child: BoxProcessor<T>) -> Result<(), Error<()>> {
        let mut children = self.children.write().await;
        let index = children
            .iter()
            .position(|c| c.identity() == before)
            .ok_or_else(|| self.out_of_bounds_error())?;
        children.insert(index, child);
        Ok(())
    }

    /// Inserts `child` directly after the first child whose identity equals
    /// `after`.
    pub async fn insert_after(&self, after: &Identity, child: BoxProcessor<T>) -> Result<(), Error<()>> {
        let mut children = self.children.write().await;
        let index = children
            .iter()
            .position(|c| c.identity() == after)
            .ok_or_else(|| self.out_of_bounds_error())?;
        children.insert(index + 1, child);
        Ok(())
    }

    /// Removes every child.
    pub async fn clear(&self) {
        self.children.write().await.clear();
    }

    /// The names of every child, in order.
    pub async fn names(&self) -> Vec<String> {
        self.children
            .read()
            .await
            .iter()
            .map(|c| c.identity().name().to_string())
            .collect()
    }

    fn empty_container_error(&self) -> Error<()> {
        Error::new(ErrorKind::EmptyContainer, EmptyContainerCause, None).with_prefixed_path(self.identity.clone())
    }

    fn out_of_bounds_error(&self) -> Error<()> {
        Error::new(ErrorKind::IndexOutOfBounds, IndexOutOfBoundsCause, None).with_prefixed_path(self.identity.clone())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sequence is empty")]
struct EmptyContainerCause;

#[derive(Debug, thiserror::Error)]
#[error("index out of bounds")]
struct IndexOutOfBoundsCause;

#[async_trait]
impl<T> Processor<T> for Sequence<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let snapshot = self.children.read().await.clone();

        let mut value = input;
        for child in snapshot.iter() {
            if ctx.is_canceled() {
                return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(value))
                    .with_prefixed_path(self.identity.clone()));
            }
            value = match child.process(ctx, value).await {
                Ok(v) => v,
                Err(err) => return Err(err.with_prefixed_path(self.identity.clone())),
            };
        }
        Ok(value)
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
                        tracing::warn!(child = %child.identity(), error = %err, "child close failed");
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
        SchemaNode::leaf(self.identity.clone(), "sequence").with_children("children", snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("context canceled")]
struct CanceledCause;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;

    fn transform<T: Send + 'static>(name: &str, f: impl Fn(T) -> T + Send + Sync + 'static) -> BoxProcessor<T> {
        std::sync::Arc::new(Transform::new(Identity::new(name), move |_ctx, x| {
            let out = f(x);
            async move { out }
        }))
    }

    #[tokio::test]
    async fn processes_children_in_order() {
        let seq = Sequence::with_children(
            Identity::new("pipeline"),
            vec![transform("add-one", |x: i32| x + 1), transform("double", |x| x * 2)],
        );
        let out = seq.process(&Context::new(), 5).await.unwrap();
        assert_eq!(out, 12);
    }

    #[tokio::test]
    async fn stops_at_first_failure_and_prepends_path() {
        use crate::adapters::Apply;

        #[derive(Debug, thiserror::Error)]
        #[error("stage failed")]
        struct StageFailed;

        let seq: Sequence<i32> = Sequence::new(Identity::new("pipeline"));
        seq.push(transform("first", |x| x + 1)).await;
        let failing = Identity::new("failing-stage");
        let failing_id = failing.id();
        seq.push(std::sync::Arc::new(Apply::new(failing, |_ctx, _x: i32| async move {
            Err::<i32, StageFailed>(StageFailed)
        })))
        .await;
        seq.push(transform("never-reached", |x| x * 100)).await;

        let err = seq.process(&Context::new(), 1).await.unwrap_err();
        assert_eq!(err.path().first().unwrap().name(), "pipeline");
        assert_eq!(err.path().last().unwrap().id(), failing_id);
    }

    #[tokio::test]
    async fn mutation_does_not_tear_in_flight_snapshot() {
        let seq: Sequence<i32> = Sequence::new(Identity::new("pipeline"));
        seq.push(transform("add-one", |x| x + 1)).await;

        let names_before = seq.names().await;
        assert_eq!(names_before, vec!["add-one"]);

        seq.push(transform("double", |x| x * 2)).await;
        let out = seq.process(&Context::new(), 10).await.unwrap();
        assert_eq!(out, 22);
    }
}
