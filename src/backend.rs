//! The metrics-backend interface this crate consumes.
//!
//! The pipeline stores no metric values itself. Instruments are declared
//! against a [`MetricsBackend`], which owns the backing storage and must
//! support concurrent updates from multiple threads. The crate ships one
//! implementation, [`crate::MemoryBackend`], for tests and local
//! development; production deployments plug in their own.

use std::sync::Arc;

use crate::error::BackendError;
use crate::labels::LabelSet;

/// What kind of instrument a declaration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    /// Monotonically increasing count.
    Counter,
    /// Distribution over fixed bucket boundaries.
    Histogram,
}

/// Measurement unit attached to a declaration.
///
/// Purely descriptive: the backend may surface it in metadata, but no
/// conversion happens on its account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Values are in seconds.
    Seconds,
}

/// A single instrument declaration.
///
/// Declared exactly once at install time and immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentSpec {
    /// Instrument name, e.g. `requests_total`.
    pub name: &'static str,
    /// Counter or histogram.
    pub kind: InstrumentKind,
    /// Label keys every update must carry.
    pub tags: &'static [&'static str],
    /// Bucket upper bounds, ascending. Histograms only.
    pub buckets: Option<&'static [f64]>,
    /// Measurement unit, if any.
    pub unit: Option<Unit>,
    /// Human-readable description.
    pub help: &'static str,
}

/// A monotonically increasing instrument.
pub trait Counter: Send + Sync {
    /// Increment the series identified by `labels` by one.
    fn increment(&self, labels: &LabelSet) -> Result<(), BackendError>;
}

/// A distribution instrument.
pub trait Histogram: Send + Sync {
    /// Observe a value for the series identified by `labels`.
    ///
    /// `None` means the event did not carry the measurement; whether to
    /// drop it, record a zero, or track absence separately is the backend's
    /// decision.
    fn observe(&self, labels: &LabelSet, value: Option<f64>) -> Result<(), BackendError>;
}

impl std::fmt::Debug for dyn Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Histogram")
    }
}

/// A metrics store that can mint instruments.
///
/// Declaration must be idempotent: redeclaring a name returns the existing
/// instrument instead of failing. [`crate::RequestMetrics::install`] relies
/// on this to make retries after a partial failure safe.
pub trait MetricsBackend: Send + Sync {
    /// Declare (or re-resolve) a counter.
    fn define_counter(&self, spec: InstrumentSpec) -> Result<Arc<dyn Counter>, BackendError>;

    /// Declare (or re-resolve) a histogram.
    fn define_histogram(&self, spec: InstrumentSpec) -> Result<Arc<dyn Histogram>, BackendError>;
}
