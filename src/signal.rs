//! Fire-and-forget structured signals emitted at connector boundaries.
//!
//! See [`Signal`] and [`SignalSink`] for more details.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A typed field value attached to a [`Signal`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Duration(Duration),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => f.write_str(s),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Duration(d) => write!(f, "{d:?}"),
        }
    }
}

macro_rules! impl_from_for_field_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from_for_field_value! {
    &str => Str,
    String => Str,
    i64 => Int,
    i32 => Int,
    u32 => Int,
    usize => Int,
    f64 => Float,
    bool => Bool,
    Duration => Duration,
}

/// A single structured signal: a dotted kind (e.g. `"circuitbreaker.opened"`,
/// `"ratelimiter.throttled"`) and an ordered bag of typed fields.
///
/// Signals are cheap to construct and are delivered best-effort: a
/// [`SignalSink`] that errors, blocks, or drops a signal must never affect
/// the processing path that emitted it.
#[derive(Debug, Clone)]
pub struct Signal {
    kind: &'static str,
    fields: BTreeMap<&'static str, FieldValue>,
}

impl Signal {
    /// Returns a new signal of the given dotted `kind` with no fields.
    pub fn new(kind: &'static str) -> Self {
        Signal {
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Attaches a field, overwriting any previous value under the same key.
    #[must_use]
    pub fn with_field(mut self, key: &'static str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key, value.into());
        self
    }

    /// The dotted kind of this signal.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Looks up a field by key.
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Iterates over every field in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }
}

/// A pluggable destination for [`Signal`]s emitted by connectors.
///
/// `publish` must never block the caller for long and must never panic;
/// connectors treat publishing as best-effort and never inspect its result.
/// A blanket implementation covers any `Fn(&Signal) + Send + Sync`, so a
/// plain closure (or a channel sender wrapped in one) is a valid sink.
pub trait SignalSink: Send + Sync {
    /// Publishes `signal`. Implementations should return quickly; slow
    /// sinks should hand `signal` off to a background task themselves.
    fn publish(&self, signal: &Signal);
}

impl<F> SignalSink for F
where
    F: Fn(&Signal) + Send + Sync,
{
    fn publish(&self, signal: &Signal) {
        self(signal)
    }
}

impl SignalSink for Arc<dyn SignalSink> {
    fn publish(&self, signal: &Signal) {
        self.as_ref().publish(signal)
    }
}

/// A [`SignalSink`] that discards every signal. The default for connectors
/// constructed without an explicit sink, so embedders who don't need
/// telemetry pay no cost beyond a `no-op` vtable call.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignalSink;

impl SignalSink for NoopSignalSink {
    fn publish(&self, _signal: &Signal) {}
}

/// Returns the shared, null [`SignalSink`] wrapped in an `Arc`.
pub fn noop_sink() -> Arc<dyn SignalSink> {
    Arc::new(NoopSignalSink)
}
