//! Error-observer sidecar.
//!
//! See [`Handle`] for more details.

use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;
use crate::panic;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A processor over the *error* type: given a reference to the structured
/// error a child produced, does something with it (log, signal, forward to
/// a dead-letter queue) without being able to alter what `Handle` returns.
#[async_trait]
pub trait ErrorHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Observes `error`. A handler failure is signaled by `Handle`, never
    /// propagated to the caller.
    async fn handle(&self, ctx: &Context, error: &Error<T>) -> Result<(), Error<()>>;
}

#[async_trait]
impl<T, F, Fut, E> ErrorHandler<T> for F
where
    T: Send + 'static,
    F: Fn(Context, &Error<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send,
    E: std::error::Error + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &Context, error: &Error<T>) -> Result<(), Error<()>> {
        let identity = Identity::new("error-handler");
        match panic::guard_async(&identity, || None, self(ctx.clone(), error)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(cause)) => Err(Error::new(crate::error::ErrorKind::ProcessorFailure, cause, None)),
            Err(panicked) => Err(panicked.erase_input()),
        }
    }
}

/// Wraps a child and an [`ErrorHandler`].
///
/// On child success, `Handle` returns the result unchanged. On child
/// failure, it invokes the handler (observing, never swallowing) before
/// returning the original error unchanged; the handler's own failure is
/// signaled, not propagated.
pub struct Handle<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    handler: Arc<dyn ErrorHandler<T>>,
    sink: Arc<dyn SignalSink>,
    close_once: CloseOnce,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    /// Wraps `child`, invoking `handler` on every failure.
    pub fn new(identity: Identity, child: BoxProcessor<T>, handler: Arc<dyn ErrorHandler<T>>) -> Self {
        Handle {
            identity,
            child,
            handler,
            sink: noop_sink(),
            close_once: CloseOnce::new(),
        }
    }

    /// Attaches a [`SignalSink`] that observes `"handle.handler_failed"`
    /// signals when the handler itself fails.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[async_trait]
impl<T> Processor<T> for Handle<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        match self.child.process(ctx, input).await {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Err(handler_err) = self.handler.handle(ctx, &err).await {
                    tracing::warn!(
                        processor = %self.identity,
                        error = %handler_err,
                        "error handler failed"
                    );
                    self.sink.publish(
                        &Signal::new("handle.handler_failed")
                            .with_field("name", self.identity.name().to_string())
                            .with_field("error", handler_err.to_string()),
                    );
                }
                Err(err.with_prefixed_path(self.identity.clone()))
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
        SchemaNode::leaf(self.identity.clone(), "handle").with_children("child", vec![self.child.schema()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Apply;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn handler_observes_without_swallowing() {
        let handled = Arc::new(AtomicBool::new(false));
        let captured = Arc::clone(&handled);

        let child: BoxProcessor<i32> =
            Arc::new(Apply::new(Identity::new("failing"), |_ctx, _x: i32| async move { Err::<i32, Boom>(Boom) }));
        let handler: Arc<dyn ErrorHandler<i32>> = Arc::new(move |_ctx: Context, _err: &Error<i32>| {
            captured.store(true, Ordering::SeqCst);
            async move { Ok::<(), Boom>(()) }
        });

        let handle = Handle::new(Identity::new("handle"), child, handler);
        let err = handle.process(&Context::new(), 1).await.unwrap_err();

        assert!(handled.load(Ordering::SeqCst));
        assert_eq!(err.path().first().unwrap().name(), "handle");
    }
}
