//! Per-request metrics instrumentation.
//!
//! milepost turns completed-request events into updates on six fixed
//! instruments: a request counter and histograms for latency, view
//! rendering time, database query count, database execution time, and CPU
//! time. All six share one label schema (`controller`, `action`, `status`,
//! `format`, `method`) so series line up across instruments.
//!
//! The pipeline is host-agnostic: anything that can deliver a
//! [`RawActionEvent`] through an [`EventSource`] can be instrumented. An
//! axum integration ships behind the default `axum` feature.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{routing::get, Json, Router};
//! use milepost::{action, ActionEvents, InstrumentedRouter, RequestMetrics};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let events = ActionEvents::new();
//! let metrics = Arc::new(
//!     RequestMetrics::builder()
//!         .default_tag("service", "api")
//!         .default_tags_from_env()
//!         .build(),
//! );
//! metrics.install(&events)?;
//!
//! let app: Router = Router::new()
//!     .route(
//!         "/users/:id",
//!         get(|| async { (action("users", "show"), Json(serde_json::json!({}))) }),
//!     )
//!     .instrument_requests(events);
//! # let _ = app;
//! # Ok(())
//! # }
//! ```
//!
//! # Custom handlers
//!
//! Every decoded event fans out through a handler chain in registration
//! order; the instrument updater that `install` registers is just the
//! default member. Register additional [`RequestHandler`]s with
//! [`RequestMetrics::on_action`] for custom side effects such as per-tenant
//! accounting or slow-request logging.
//!
//! # Backends
//!
//! Instruments are declared against a [`MetricsBackend`], which owns the
//! storage. [`MemoryBackend`] ships for tests and local development;
//! production deployments implement the trait over their metrics store.

mod backend;
mod convert;
mod error;
mod event;
mod handler;
mod instruments;
pub mod labels;
mod memory;
mod pipeline;

#[cfg(feature = "axum")]
mod integration;

pub use backend::{Counter, Histogram, InstrumentKind, InstrumentSpec, MetricsBackend, Unit};
pub use convert::ms_to_secs;
pub use error::{BackendError, MalformedEvent, PipelineError};
pub use event::{RawActionEvent, RequestEvent};
pub use handler::{handler_fn, HandlerChain, RequestHandler};
pub use instruments::{
    RequestInstruments, DB_QUERY_COUNT_BUCKETS, DEFAULT_BUCKETS, LONG_RUNNING_REQUEST_BUCKETS,
};
pub use labels::{LabelSet, TAGS};
pub use memory::{HistogramSnapshot, MemoryBackend};
pub use pipeline::{
    EventSink, EventSource, RequestMetrics, RequestMetricsBuilder, DEFAULT_TAGS_ENV,
};

#[cfg(feature = "axum")]
pub use integration::{
    action, ActionEvents, ControllerAction, InstrumentedRouter, RequestTimings,
};
