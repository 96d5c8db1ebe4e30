//! Ordered alternatives, first success wins.
//!
//! See [`Fallback`] for more details.

use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// An ordered list of children; `Process` tries each in turn, returning the
/// first success. If every child fails, returns an aggregated error whose
/// cause references the last child's cause and whose path begins with this
/// `Fallback`'s identity.
pub struct Fallback<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    close_once: CloseOnce,
}

impl<T> Fallback<T>
where
    T: Clone + Send + 'static,
{
    /// Returns a new `Fallback` over `children`, tried in order.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>) -> Self {
        Fallback {
            identity,
            children: RwLock::new(children),
            close_once: CloseOnce::new(),
        }
    }

    /// Appends an alternative, tried after every existing one.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T> Processor<T> for Fallback<T>
where
    T: Clone + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let snapshot = self.children.read().await.clone();
        let mut last_err = None;

        for child in snapshot.iter() {
            if ctx.is_canceled() {
                return Err(Error::new(ErrorKind::Canceled, CanceledCause, Some(input))
                    .with_prefixed_path(self.identity.clone()));
            }
            match child.process(ctx, input.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => last_err = Some(err),
            }
        }

        match last_err {
            Some(err) => {
                let duration = err.duration();
                Err(Error::new(ErrorKind::AllAlternativesFailed, err.into_cause(), Some(input))
                    .with_duration(duration)
                    .with_prefixed_path(self.identity.clone()))
            }
            None => Ok(input),
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
        SchemaNode::leaf(self.identity.clone(), "fallback").with_children("alternatives", snapshot)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("context canceled")]
struct CanceledCause;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Apply;
    use std::sync::Arc;

    #[derive(Debug, thiserror::Error)]
    #[error("nope")]
    struct Nope;

    fn failing(name: &str) -> BoxProcessor<i32> {
        Arc::new(Apply::new(Identity::new(name), |_ctx, _x: i32| async move { Err::<i32, Nope>(Nope) }))
    }

    fn succeeding(name: &str, value: i32) -> BoxProcessor<i32> {
        Arc::new(Apply::new(Identity::new(name), move |_ctx, _x: i32| async move { Ok::<i32, Nope>(value) }))
    }

    #[tokio::test]
    async fn returns_first_success() {
        let fb = Fallback::new(Identity::new("fallback"), vec![failing("a"), succeeding("b", 42), failing("c")]);
        let out = fb.process(&Context::new(), 0).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn aggregates_when_all_fail() {
        let fb = Fallback::new(Identity::new("fallback"), vec![failing("a"), failing("b")]);
        let err = fb.process(&Context::new(), 0).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AllAlternativesFailed));
        assert_eq!(err.path().first().unwrap().name(), "fallback");
    }
}
