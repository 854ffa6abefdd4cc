//! Durable archiver for a publish/subscribe message stream.
//!
//! Every message read from the source is given an identity, checked against the
//! catalog for duplicates, written to the object store as a self-describing bundle,
//! recorded in the catalog, and only then acknowledged to the source.
//!
//! ## Error logging
//!
//! Log errors with `{e:#}` or `error = ?e` so the full cause chain is visible. When
//! wrapping, use `.context()` / `.with_context()` so the original error stays the source.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod decision;
pub mod identity;
pub mod metrics_const;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod source;
pub mod store;
pub mod types;

pub use pipeline::{Outcome, Pipeline, PipelineError, RunSummary};
pub use types::{Annotations, Bundle, Header, HeaderValue, Message, Metadata};
