//! Failure-rate gate wrapping a single child.
//!
//! See [`CircuitBreaker`] for more details.

use crate::clock::{real_clock, Clock};
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::identity::Identity;
use crate::processor::{BoxProcessor, Processor};
use crate::schema::SchemaNode;
use crate::signal::{noop_sink, Signal, SignalSink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// The circuit breaker's three-state machine, as in spec §4.13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests run normally. A streak of `failure_threshold` consecutive
    /// failures opens the circuit.
    Closed,
    /// Requests are rejected without running the child until
    /// `reset_timeout` elapses since the last failure.
    Open,
    /// A probe request is allowed through; `success_threshold` consecutive
    /// successes close the circuit, any failure reopens it.
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_fail_time: Option<Instant>,
    probe_in_flight: bool,
}

/// Wraps a single child with a Closed/Open/Half-Open failure-rate gate.
///
/// A monotonic generation counter (visible internally only) is bumped on
/// every state transition; an in-flight probe captures the generation it
/// started in, so a late-completing probe whose generation has since moved
/// on cannot cause a spurious transition in what is now a later epoch.
/// State updates are serialized under a single lock; the child invocation
/// itself always runs with the lock released.
pub struct CircuitBreaker<T> {
    identity: Identity,
    child: BoxProcessor<T>,
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
    generation: AtomicU64,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn SignalSink>,
}

impl<T> CircuitBreaker<T>
where
    T: Send + 'static,
{
    /// Wraps `child`, opening after `failure_threshold` consecutive Closed-state
    /// failures (clamped to at least 1), staying open for `reset_timeout`,
    /// and requiring `success_threshold` consecutive Half-Open successes
    /// (clamped to at least 1) to close again.
    pub fn new(identity: Identity, child: BoxProcessor<T>, failure_threshold: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        CircuitBreaker {
            identity,
            child,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_fail_time: None,
                probe_in_flight: false,
            }),
            generation: AtomicU64::new(0),
            clock: real_clock(),
            sink: noop_sink(),
        }
    }

    /// Replaces the clock used to measure `reset_timeout`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attaches a [`SignalSink`] that observes `"circuitbreaker.opened"`,
    /// `"circuitbreaker.closed"`, and `"circuitbreaker.rejected"` signals.
    #[must_use]
    pub fn with_signal_sink(mut self, sink: Arc<dyn SignalSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The current state of the breaker.
    pub fn state(&self) -> State {
        self.inner.lock().expect("circuit breaker lock poisoned").state
    }

    fn emit_opened(&self) {
        tracing::warn!(processor = %self.identity, state = "open", "circuit breaker opened");
        self.sink.publish(
            &Signal::new("circuitbreaker.opened")
                .with_field("name", self.identity.name().to_string())
                .with_field("state", "open"),
        );
    }

    fn emit_closed(&self) {
        tracing::warn!(processor = %self.identity, state = "closed", "circuit breaker closed");
        self.sink.publish(
            &Signal::new("circuitbreaker.closed")
                .with_field("name", self.identity.name().to_string())
                .with_field("state", "closed"),
        );
    }

    fn emit_rejected(&self) {
        tracing::warn!(processor = %self.identity, state = "open", "circuit breaker rejected request");
        self.sink.publish(
            &Signal::new("circuitbreaker.rejected")
                .with_field("name", self.identity.name().to_string())
                .with_field("state", "open"),
        );
    }
}

#[async_trait]
impl<T> Processor<T> for CircuitBreaker<T>
where
    T: Send + 'static,
{
    async fn process(&self, ctx: &Context, input: T) -> Result<T, Error<T>> {
        let generation;
        {
            let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
            match inner.state {
                State::Open => {
                    let elapsed_ok = inner
                        .last_fail_time
                        .is_some_and(|last| self.clock.now().saturating_duration_since(last) >= self.reset_timeout);
                    if elapsed_ok {
                        inner.state = State::HalfOpen;
                        inner.consecutive_successes = 0;
                        inner.probe_in_flight = true;
                        self.generation.fetch_add(1, Ordering::SeqCst);
                        generation = self.generation.load(Ordering::SeqCst);
                    } else {
                        drop(inner);
                        self.emit_rejected();
                        return Err(Error::new(ErrorKind::CircuitOpen, CircuitOpenCause, Some(input))
                            .with_prefixed_path(self.identity.clone()));
                    }
                }
                State::HalfOpen => {
                    if inner.probe_in_flight {
                        drop(inner);
                        self.emit_rejected();
                        return Err(Error::new(ErrorKind::CircuitOpen, CircuitOpenCause, Some(input))
                            .with_prefixed_path(self.identity.clone()));
                    }
                    inner.probe_in_flight = true;
                    generation = self.generation.load(Ordering::SeqCst);
                }
                State::Closed => {
                    generation = self.generation.load(Ordering::SeqCst);
                }
            }
        }

        let result = self.child.process(ctx, input).await;

        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        let current_generation = self.generation.load(Ordering::SeqCst);
        if generation != current_generation {
            // The breaker moved to a later epoch while this probe/request was
            // in flight; surface the child's result but don't let it disturb
            // whatever state transitions already happened.
            return result.map_err(|err| err.with_prefixed_path(self.identity.clone()));
        }

        match (&result, inner.state) {
            (Ok(_), State::Closed) => {
                inner.consecutive_failures = 0;
            }
            (Ok(_), State::HalfOpen) => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.success_threshold {
                    inner.state = State::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    drop(inner);
                    self.emit_closed();
                }
            }
            (Err(_), State::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.last_fail_time = Some(self.clock.now());
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    drop(inner);
                    self.emit_opened();
                }
            }
            (Err(_), State::HalfOpen) => {
                inner.probe_in_flight = false;
                inner.state = State::Open;
                inner.last_fail_time = Some(self.clock.now());
                inner.consecutive_successes = 0;
                self.generation.fetch_add(1, Ordering::SeqCst);
                drop(inner);
                self.emit_opened();
            }
            (_, State::Open) => {
                // Can't be reached: this function only runs the child from
                // Closed or HalfOpen.
            }
        }

        result.map_err(|err| err.with_prefixed_path(self.identity.clone()))
    }

    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn close(&self) -> Result<(), Error<()>> {
        self.child.close().await.map_err(|err| err.with_prefixed_path(self.identity.clone()))
    }

    fn schema(&self) -> SchemaNode {
        let state = self.state();
        SchemaNode::leaf(self.identity.clone(), "circuit_breaker")
            .with_metadata("failure_threshold", self.failure_threshold.to_string())
            .with_metadata("success_threshold", self.success_threshold.to_string())
            .with_metadata("reset_timeout_ms", self.reset_timeout.as_millis().to_string())
            .with_metadata("state", format!("{state:?}"))
            .with_children("child", vec![self.child.schema()])
    }
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker is open")]
struct CircuitOpenCause;
