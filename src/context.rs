//! Cancellation-aware context threaded through every [`Processor::process`]
//! call.
//!
//! See [`Context`] for more details.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A composable value carrying a cancellation signal, an optional deadline,
/// and arbitrary key-value pairs, threaded through every processor
/// invocation.
///
/// `Context` is cheap to clone: cancellation is a shared
/// [`CancellationToken`], the deadline is `Copy`, and the value bag is
/// reference-counted and copy-on-write.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    values: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Context {
    /// Returns a new, non-canceled `Context` with no deadline and an empty
    /// value bag.
    pub fn new() -> Self {
        Context {
            cancel: CancellationToken::new(),
            deadline: None,
            values: Arc::new(HashMap::new()),
        }
    }

    /// Returns `true` if this context (or any ancestor it was derived from
    /// via [`child`][Self::child]) has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context is canceled. Used by every blocking
    /// primitive in the kernel to race work against cancellation.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }

    /// Cancels this context and every context derived from it via
    /// [`child`][Self::child] (but not contexts derived via
    /// [`detached`][Self::detached]).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The deadline attached to this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` if this context carries a deadline that has already
    /// passed.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns a child context that shares this context's value bag,
    /// inherits cancellation from it (canceling the parent cancels the
    /// child), and carries the given deadline. This is what
    /// [`Timeout`](crate::connectors::timeout::Timeout) uses to bound a
    /// child invocation.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        Context {
            cancel: self.cancel.child_token(),
            deadline: Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            }),
            values: Arc::clone(&self.values),
        }
    }

    /// Returns a plain child context: shares the value bag and inherits
    /// cancellation, with no deadline of its own.
    pub fn child(&self) -> Self {
        Context {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            values: Arc::clone(&self.values),
        }
    }

    /// Returns a *detached* context: preserves this context's values, but
    /// gets a fresh, independent cancellation signal and no deadline. Used
    /// by [`Scaffold`](crate::connectors::scaffold::Scaffold) so spawned
    /// tasks outlive the caller's cancellation.
    pub fn detached(&self) -> Self {
        Context {
            cancel: CancellationToken::new(),
            deadline: None,
            values: Arc::clone(&self.values),
        }
    }

    /// Returns a new context carrying an additional key-value pair. Earlier
    /// values with the same key are shadowed, not removed.
    #[must_use]
    pub fn with_value<V: Send + Sync + 'static>(&self, key: impl Into<String>, value: V) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), Arc::new(value) as Arc<dyn Any + Send + Sync>);
        Context {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            values: Arc::new(values),
        }
    }

    /// Looks up a value previously attached with [`with_value`][Self::with_value].
    pub fn get<V: Send + Sync + 'static>(&self, key: &str) -> Option<&V> {
        self.values.get(key).and_then(|value| value.downcast_ref::<V>())
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_inherits_parent_cancellation() {
        let parent = Context::new();
        let child = parent.child();
        assert!(!child.is_canceled());
        parent.cancel();
        assert!(child.is_canceled());
    }

    #[tokio::test]
    async fn detached_does_not_inherit_cancellation() {
        let parent = Context::new();
        let detached = parent.detached();
        parent.cancel();
        assert!(parent.is_canceled());
        assert!(!detached.is_canceled());
    }

    #[test]
    fn detached_preserves_values() {
        let parent = Context::new().with_value("trace_id", 42_u64);
        let detached = parent.detached();
        assert_eq!(detached.get::<u64>("trace_id"), Some(&42));
    }

    #[test]
    fn child_with_deadline_takes_the_earlier_deadline() {
        let now = Instant::now();
        let parent = Context::new().child_with_deadline(now + std::time::Duration::from_secs(10));
        let child = parent.child_with_deadline(now + std::time::Duration::from_secs(1));
        assert_eq!(child.deadline(), Some(now + std::time::Duration::from_secs(1)));
    }
}
