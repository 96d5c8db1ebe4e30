//! Structured errors returned by [`Processor::process`](crate::processor::Processor::process).
//!
//! See [`Error`] for more details.

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use thiserror::Error as ThisError;

/// The semantic kind of an [`Error`].
///
/// Kind names describe *why* a pipeline failed, independent of which
/// connector produced the failure (that's what [`Error::path`] is for).
#[derive(Debug, Clone, ThisError)]
pub enum ErrorKind {
    /// A child processor returned a non-kernel error, wrapped at the leaf
    /// that produced it.
    #[error("processor failed")]
    ProcessorFailure,
    /// The caller's [`Context`](crate::context::Context) was canceled
    /// mid-run.
    #[error("context canceled")]
    Canceled,
    /// A [`Timeout`](crate::connectors::timeout::Timeout) connector's
    /// deadline was exceeded.
    #[error("deadline exceeded")]
    Timeout,
    /// A [`CircuitBreaker`](crate::connectors::circuit_breaker::CircuitBreaker)
    /// rejected the request because it is open.
    #[error("circuit breaker open")]
    CircuitOpen,
    /// A [`RateLimiter`](crate::connectors::rate_limiter::RateLimiter) in
    /// drop mode had no tokens available.
    #[error("rate limit exceeded")]
    RateLimited,
    /// A [`Fallback`](crate::connectors::fallback::Fallback) exhausted every
    /// alternative.
    #[error("all alternatives failed")]
    AllAlternativesFailed,
    /// A [`Retry`](crate::connectors::retry::Retry) or
    /// [`Backoff`](crate::connectors::retry::Backoff) exhausted its attempts.
    #[error("retries exhausted")]
    RetriesExhausted,
    /// A [`Contest`](crate::connectors::race::Contest) finished without any
    /// child result satisfying its predicate.
    #[error("no satisfying result")]
    NoSatisfyingResult,
    /// A processor function raised an uncaught fault; the message has been
    /// sanitized by [`crate::panic::sanitize_message`].
    #[error("processor panicked: {0}")]
    Panic(String),
    /// Returned from a mutation API (e.g. [`Sequence::remove`][seq]) when an
    /// index was out of range. Never returned from `Process`.
    ///
    /// [seq]: crate::connectors::sequence::Sequence::remove
    #[error("index out of bounds")]
    IndexOutOfBounds,
    /// Returned from a mutation API when attempting to operate on an empty
    /// child list. Never returned from `Process`.
    #[error("container is empty")]
    EmptyContainer,
}

/// A structured error returned from a failed pipeline invocation.
///
/// Every connector that wraps a child error prepends its own [`Identity`] to
/// [`path`][Self::path] before re-surfacing it; non-kernel errors are
/// wrapped exactly once, at the leaf that produced them.
pub struct Error<T> {
    path: Vec<Identity>,
    input_data: Option<T>,
    cause: Box<dyn StdError + Send + Sync>,
    kind: ErrorKind,
    timestamp: DateTime<Utc>,
    duration: Duration,
    timeout: bool,
    canceled: bool,
}

impl<T> Error<T> {
    /// Constructs a new `Error` of the given `kind`, caused by `cause`, at
    /// the leaf that observed `input_data`.
    ///
    /// `timeout`/`canceled` are derived automatically from `kind`, matching
    /// the "set when the cause derives from deadline or explicit
    /// cancellation" rule in the data model.
    pub fn new(
        kind: ErrorKind,
        cause: impl Into<Box<dyn StdError + Send + Sync>>,
        input_data: Option<T>,
    ) -> Self {
        let timeout = matches!(kind, ErrorKind::Timeout);
        let canceled = matches!(kind, ErrorKind::Canceled);
        Error {
            path: Vec::new(),
            input_data,
            cause: cause.into(),
            kind,
            timestamp: Utc::now(),
            duration: Duration::ZERO,
            timeout,
            canceled,
        }
    }

    /// Prepends `identity` to [`path`][Self::path]. Every connector that
    /// observes a child error calls this exactly once before returning.
    #[must_use]
    pub fn with_prefixed_path(mut self, identity: Identity) -> Self {
        self.path.insert(0, identity);
        self
    }

    /// Attaches the wall-clock duration the failing invocation took.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Overrides the construction timestamp, used when replaying a cached
    /// `Close` outcome that must report the moment the original failure
    /// happened, not the moment it was replayed.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The ordered sequence of identities from the outermost connector the
    /// call entered down to the failing leaf. Non-empty for every error
    /// returned from `Process`.
    pub fn path(&self) -> &[Identity] {
        &self.path
    }

    /// The value observed at the failing stage, if the connector preserved
    /// it (`Process` always provides it for leaf failures; some connectors
    /// cannot meaningfully reconstruct it for aggregate failures).
    pub fn input_data(&self) -> Option<&T> {
        self.input_data.as_ref()
    }

    /// Takes ownership of the preserved input value, if any.
    pub fn into_input_data(self) -> Option<T> {
        self.input_data
    }

    /// The underlying cause of this error.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync) {
        self.cause.as_ref()
    }

    /// Takes ownership of the underlying cause, discarding path/kind/input
    /// and the rest of this error's metadata. Used by connectors that
    /// surface a child's cause as their own (e.g. an aggregated error on
    /// exhaustion) without wrapping it a second time.
    pub fn into_cause(self) -> Box<dyn StdError + Send + Sync> {
        self.cause
    }

    /// The semantic kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// When this error was constructed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// How long the failing invocation ran before failing.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether this error derives from a deadline expiring.
    pub fn is_timeout(&self) -> bool {
        self.timeout
    }

    /// Whether this error derives from explicit cancellation.
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Re-maps the preserved input value, used when a connector can produce
    /// a more informative `T` (e.g. the original, un-cloned input) than the
    /// one a child reported.
    pub fn map_input_data<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<T>) -> Option<T>,
    {
        self.input_data = f(self.input_data);
        self
    }

    /// Drops the preserved input value and erases `T`, used when an error
    /// crosses into a context with no meaningful input type (e.g. an
    /// [`ErrorHandler`](crate::connectors::handle::ErrorHandler)'s own
    /// failure, or a mutation API's error).
    pub fn erase_input(self) -> Error<()> {
        Error {
            path: self.path,
            input_data: None,
            cause: self.cause,
            kind: self.kind,
            timestamp: self.timestamp,
            duration: self.duration,
            timeout: self.timeout,
            canceled: self.canceled,
        }
    }
}

impl<T> fmt::Debug for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("cause", &self.cause)
            .field("timeout", &self.timeout)
            .field("canceled", &self.canceled)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.kind, self.cause)
        } else {
            let path = self
                .path
                .iter()
                .map(|identity| identity.name())
                .collect::<Vec<_>>()
                .join(" > ");
            write!(f, "{}: {} (at {})", self.kind, self.cause, path)
        }
    }
}

impl<T> StdError for Error<T> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.cause.as_ref())
    }
}
