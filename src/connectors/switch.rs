//! Conditional routing: [`Switch`] (N-way) and [`Filter`] (single branch).

use crate::close_once::CloseOnce;
use crate::context::Context;
use crate::error::Error;
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Evaluates a condition `(ctx, T) -> route-key` and dispatches to the
/// matching child in a key-to-child table. When no route matches the
/// condition's key, the input passes through unchanged — an explicit
/// passthrough, not an error.
pub struct Switch<T, C> {
    identity: Identity,
    condition: C,
    routes: RwLock<HashMap<String, BoxProcessor<T>>>,
    close_once: CloseOnce,
}

impl<T, C, Fut> Switch<T, C>
where
    T: Send + 'static,
    C: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = String> + Send,
{
    /// Returns a new `Switch` with no routes registered.
    pub fn new(identity: Identity, condition: C) -> Self {
        Switch {
            identity,
            condition,
            routes: RwLock::new(HashMap::new()),
            close_once: CloseOnce::new(),
        }
    }

    /// Registers (or replaces) the child routed to when `condition` yields
    /// `key`.
    pub async fn set_route(&self, key: impl Into<String>, child: BoxProcessor<T>) {
        self.routes.write().await.insert(key.into(), child);
    }

    /// Removes the route for `key`, if any.
    pub async fn remove_route(&self, key: &str) {
        self.routes.write().await.remove(key);
    }

    /// The currently registered route keys.
    pub async fn route_keys(&self) -> Vec<String> {
        self.routes.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl<T, C, Fut> Processor<T> for Switch<T, C>
where
    T: Send + 'static,
    C: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = String> + Send,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let key = (self.condition)(ctx.clone(), &input).await;
        let routed = self.routes.read().await.get(&key).cloned();
        match routed {
            Some(child) => child.process(ctx, input).await.map_err(|err| err.with_prefixed_path(self.identity.clone())),
            None => Ok(input),
        }
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.close_once
            .run(async {
                let snapshot: Vec<_> = self.routes.read().await.values().cloned().collect();
                let mut first_err = None;
                for child in snapshot.iter() {
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
            .routes
            .try_read()
            .map(|guard| guard.iter().map(|(k, c)| c.schema().with_metadata("route", k.clone())).collect::<Vec<_>>())
            .unwrap_or_default();
        SchemaNode::leaf(self.identity.clone(), "switch").with_children("routes", snapshot)
    }
}

/// Filter's single-branch specialization of [`Switch`]: a predicate
/// `(ctx, T) -> bool` gates a single wrapped child; when false, the input
/// passes through unchanged. Provided for readability and cheaper dispatch
/// than a one-route `Switch`.
pub struct Filter<T, P> {
    identity: Identity,
    predicate: P,
    child: Arc<RwLock<BoxProcessor<T>>>,
    close_once: CloseOnce,
}

impl<T, P, Fut> Filter<T, P>
where
    T: Send + 'static,
    P: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    /// Wraps `child`, running it only when `predicate` returns `true`.
    pub fn new(identity: Identity, predicate: P, child: BoxProcessor<T>) -> Self {
        Filter {
            identity,
            predicate,
            child: Arc::new(RwLock::new(child)),
            close_once: CloseOnce::new(),
        }
    }

    /// Replaces the wrapped child.
    pub async fn set_child(&self, child: BoxProcessor<T>) {
        *self.child.write().await = child;
    }
}

#[async_trait]
impl<T, P, Fut> Processor<T> for Filter<T, P>
where
    T: Send + 'static,
    P: Fn(Context, &T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        if !(self.predicate)(ctx.clone(), &input).await {
            return Ok(input);
        }
        let child = self.child.read().await.clone();
        child.process(ctx, input).await.map_err(|err| err.with_prefixed_path(self.identity.clone()))
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.close_once
            .run(async {
                let child = self.child.read().await.clone();
                child.close().await.map_err(|err| err.with_prefixed_path(self.identity.clone()))
            })
            .await
    }

    fn schema(&self) -> SchemaNode {
        let snapshot = self
            .child
            .try_read()
            .map(|guard| vec![guard.schema()])
            .unwrap_or_default();
        SchemaNode::leaf(self.identity.clone(), "filter").with_children("child", snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Transform;

    fn transform(name: &str, f: impl Fn(i32) -> i32 + Send + Sync + 'static) -> BoxProcessor<i32> {
        Arc::new(Transform::new(Identity::new(name), move |_ctx, x| {
            let out = f(x);
            async move { out }
        }))
    }

    #[tokio::test]
    async fn routes_to_matching_key() {
        let switch = Switch::new(Identity::new("router"), |_ctx, x: &i32| {
            let key = if *x % 2 == 0 { "even" } else { "odd" }.to_string();
            async move { key }
        });
        switch.set_route("even", transform("halve", |x| x / 2)).await;
        switch.set_route("odd", transform("triple-plus-one", |x| x * 3 + 1)).await;

        assert_eq!(switch.process(&Context::new(), 10).await.unwrap(), 5);
        assert_eq!(switch.process(&Context::new(), 3).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn passes_through_on_no_match() {
        let switch: Switch<i32, _> = Switch::new(Identity::new("router"), |_ctx, _x: &i32| async move { "missing".to_string() });
        let out = switch.process(&Context::new(), 7).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn filter_skips_when_predicate_false() {
        let filter = Filter::new(
            Identity::new("only-positive"),
            |_ctx, x: &i32| {
                let cond = *x > 0;
                async move { cond }
            },
            transform("negate", |x| -x),
        );
        assert_eq!(filter.process(&Context::new(), -4).await.unwrap(), -4);
        assert_eq!(filter.process(&Context::new(), 4).await.unwrap(), -4);
    }
}
