//! Typed, per-connector event subscriptions.
//!
//! See [`Hooks`] for more details.

use std::fmt;
use std::sync::{Arc, RwLock};

/// A registry of listeners for one typed event `E` (e.g. "processor
/// complete", "all complete", "task started"), as emitted by a specific
/// connector.
///
/// Unlike [`Signal`](crate::signal::Signal)s, which carry a dynamically
/// named kind and field bag meant for a generic sink, a hook event is a
/// concrete Rust type local to the connector that fires it (see
/// `concurrent::CompletedEvent`, `worker_pool::TaskStartedEvent`, etc.).
/// Registration is cheap; firing never blocks the caller — each listener
/// runs on its own spawned task, so a slow or panicking subscriber cannot
/// stall or poison the processing path.
pub struct Hooks<E> {
    listeners: RwLock<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> Hooks<E>
where
    E: Send + Sync + 'static,
{
    /// Returns an empty hook registry.
    pub fn new() -> Self {
        Hooks {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Registers a listener. Returns a [`Subscription`] that, when dropped,
    /// leaves the listener registered — callers that want to stop listening
    /// should use [`unsubscribe`](Subscription::id) with
    /// [`remove`](Self::remove).
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let boxed: Arc<dyn Fn(&E) + Send + Sync> = Arc::new(listener);
        let id = Arc::as_ptr(&boxed) as *const () as usize;
        self.listeners
            .write()
            .expect("hooks registry lock poisoned")
            .push(boxed);
        Subscription(id)
    }

    /// Removes a previously registered listener by its [`Subscription`] id,
    /// if it is still registered.
    pub fn remove(&self, subscription: Subscription) {
        self.listeners
            .write()
            .expect("hooks registry lock poisoned")
            .retain(|listener| Arc::as_ptr(listener) as *const () as usize != subscription.0);
    }

    /// Fires `event` to every registered listener. Each listener is invoked
    /// on its own spawned task and is never awaited by the caller: a
    /// listener that panics or never returns cannot affect `Process`.
    pub fn fire(&self, event: E)
    where
        E: Clone,
    {
        let listeners = self.listeners.read().expect("hooks registry lock poisoned").clone();
        if listeners.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for listener in listeners {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener(&event)));
            });
        }
    }

    /// The number of currently registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().expect("hooks registry lock poisoned").len()
    }

    /// Returns `true` if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Hooks<E>
where
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Hooks::new()
    }
}

impl<E> fmt::Debug for Hooks<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").field("listeners", &self.len()).finish()
    }
}

/// A handle identifying a listener registered via [`Hooks::on`], for later
/// removal via [`Hooks::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription(usize);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    struct Completed {
        count: usize,
    }

    #[tokio::test]
    async fn fire_invokes_every_listener() {
        let hooks: Hooks<Completed> = Hooks::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            hooks.on(move |event: &Completed| {
                seen.fetch_add(event.count, Ordering::SeqCst);
            });
        }

        hooks.fire(Completed { count: 1 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn removed_listener_is_not_invoked() {
        let hooks: Hooks<Completed> = Hooks::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&seen);
        let subscription = hooks.on(move |event: &Completed| {
            captured.fetch_add(event.count, Ordering::SeqCst);
        });

        hooks.remove(subscription);
        hooks.fire(Completed { count: 5 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
