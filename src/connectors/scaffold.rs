//! Fire-and-forget fan-out with detached cancellation.
//!
//! See [`Scaffold`] for more details.

use crate::clone::Cloneable;
use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Same fan-out shape as [`Concurrent`](crate::connectors::concurrent::Concurrent),
/// but `Process` returns immediately after spawning tasks — it does not
/// wait for any of them, and always returns the original input unchanged.
///
/// Spawned tasks run against [`Context::detached`]: they keep the caller's
/// values but get an independent cancellation signal, so ending the
/// caller's context does not stop them. Children still honor whatever
/// cancellation or timeout logic they implement internally. There is no
/// reducer — results and errors are only observable via signals/hooks
/// attached to each child itself.
pub struct Scaffold<T> {
    identity: Identity,
    children: RwLock<Vec<BoxProcessor<T>>>,
    close_once: CloseOnce,
}

impl<T> Scaffold<T>
where
    T: Cloneable + Send + 'static,
{
    /// Returns a new `Scaffold` over `children`.
    pub fn new(identity: Identity, children: Vec<BoxProcessor<T>>) -> Self {
        Scaffold {
            identity,
            children: RwLock::new(children),
            close_once: CloseOnce::new(),
        }
    }

    /// Appends a child to the fan-out.
    pub async fn push(&self, child: BoxProcessor<T>) {
        self.children.write().await.push(child);
    }
}

#[async_trait]
impl<T> Processor<T> for Scaffold<T>
where
    T: Cloneable + Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let snapshot = self.children.read().await.clone();
        let detached = ctx.detached();

        for child in snapshot.iter() {
            let child = Arc::clone(child);
            let child_input = input.clone_isolated();
            let child_ctx = detached.clone();
            let parent = self.identity.clone();
            tokio::spawn(async move {
                if let Err(err) = child.process(&child_ctx, child_input).await {
                    tracing::warn!(scaffold = %parent, child = %err.path().last().map(Identity::to_string).unwrap_or_default(), error = %err, "scaffolded child failed");
                }
            });
        }

        Ok(input)
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
        SchemaNode::leaf(self.identity.clone(), "scaffold").with_children("children", snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn process_returns_immediately_with_original_input() {
        let ran = Arc::new(AtomicBool::new(false));
        let captured = Arc::clone(&ran);
        let child: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("slow"), move |_ctx, x: i32| {
            let captured = Arc::clone(&captured);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                captured.store(true, Ordering::SeqCst);
                x
            }
        }));
        let scaffold = Scaffold::new(Identity::new("scaffold"), vec![child]);

        let out = scaffold.process(&Context::new(), 7).await.unwrap();
        assert_eq!(out, 7);
        assert!(!ran.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawned_children_survive_caller_cancellation() {
        let ran = Arc::new(AtomicBool::new(false));
        let captured = Arc::clone(&ran);
        let child: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("slow"), move |_ctx, x: i32| {
            let captured = Arc::clone(&captured);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                captured.store(true, Ordering::SeqCst);
                x
            }
        }));
        let scaffold = Scaffold::new(Identity::new("scaffold"), vec![child]);

        let ctx = Context::new();
        scaffold.process(&ctx, 1).await.unwrap();
        ctx.cancel();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
