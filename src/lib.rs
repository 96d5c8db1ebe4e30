//! A library for building composable, type-safe data-processing pipelines.
//!
//! # Overview
//!
//! A pipeline is an ordered or structured arrangement of *processors* that
//! each consume a value of some type `T` together with a cancellation
//! [`Context`] and return either a transformed value or a structured
//! [`Error`]. The interesting engineering lives in the **connector
//! kernel**: a small set of higher-order components ([`connectors`]) that
//! compose processors into sequences, parallel fan-outs, conditional
//! routers, retries, fallbacks, rate limiters, circuit breakers, worker
//! pools, timeouts, and error-handling stages.
//!
//! This crate covers that connector kernel plus its supporting data model:
//! processor [`identity`], structured [`error`]s with a traversal path, the
//! [`clone`] contract for parallel fan-out, and the [`signal`]/[`hooks`]
//! observability surface. Wiring a pipeline into a wire protocol, a
//! persistence layer, a query language, or a specific telemetry backend is
//! left to the embedder; this crate runs entirely in-process.
//!
//! # Getting started
//!
//! Build leaf processors with the five [`adapters`] flavors, then compose
//! them with a [`connectors::sequence::Sequence`] (or any other connector —
//! connectors are themselves [`Processor`]s, so they nest arbitrarily):
//!
//! ```
//! use flowline::adapters::Transform;
//! use flowline::connectors::sequence::Sequence;
//! use flowline::context::Context;
//! use flowline::identity::Identity;
//! use flowline::processor::{BoxProcessor, Processor};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let double: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("double"), |_ctx, x: i32| async move { x * 2 }));
//! let add_ten: BoxProcessor<i32> = Arc::new(Transform::new(Identity::new("add_ten"), |_ctx, x: i32| async move { x + 10 }));
//!
//! let pipeline = Sequence::with_children(Identity::new("pipeline"), vec![double, add_ten]);
//! let out = pipeline.process(&Context::new(), 3).await.unwrap();
//! assert_eq!(out, 16);
//! # }
//! ```
//!
//! # Feature flags
//!
//! - `json`: implements [`serde::Serialize`] for [`schema::SchemaNode`].
//! - `test-util`: exposes [`clock::TestClock`], a manually-advanced
//!   [`clock::Clock`] for deterministic tests of time-sensitive connectors.
//! - `full`: enables both of the above.

pub mod adapters;
pub mod clock;
pub mod clone;
pub(crate) mod close_once;
pub mod connectors;
pub mod context;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod panic;
pub mod processor;
pub mod schema;
pub mod signal;

pub use context::Context;
pub use error::Error;
pub use identity::Identity;
pub use processor::{BoxProcessor, Processor};
pub use schema::SchemaNode;
