//! The six fixed request instruments and the default handler that feeds
//! them.
//!
//! All six share the same five-key tag schema ([`crate::labels::TAGS`]).
//! Bucket boundaries are in seconds except for the query-count histogram.

use std::sync::Arc;

use crate::backend::{Counter, Histogram, InstrumentKind, InstrumentSpec, MetricsBackend, Unit};
use crate::convert::ms_to_secs;
use crate::error::{BackendError, PipelineError};
use crate::event::RequestEvent;
use crate::handler::RequestHandler;
use crate::labels::{LabelSet, TAGS};

/// Default latency buckets, in seconds (5 ms to 10 s).
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Latency buckets extended for long-running requests (up to 10 minutes).
pub const LONG_RUNNING_REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    600.0,
];

/// Buckets for the per-request database query count.
pub const DB_QUERY_COUNT_BUCKETS: &[f64] = &[1.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// Handles to the six declared instruments.
pub struct RequestInstruments {
    /// Total number of requests processed.
    pub requests_total: Arc<dyn Counter>,
    /// Response latency, in seconds.
    pub request_duration: Arc<dyn Histogram>,
    /// View rendering time, in seconds.
    pub view_runtime: Arc<dyn Histogram>,
    /// Database queries issued per request.
    pub db_query_count: Arc<dyn Histogram>,
    /// Database execution time, in seconds.
    pub db_runtime: Arc<dyn Histogram>,
    /// CPU time consumed per request.
    pub cpu_time: Arc<dyn Histogram>,
}

impl RequestInstruments {
    /// Declare all six instruments against `backend`.
    ///
    /// # Errors
    ///
    /// Propagates the first [`BackendError`]; nothing is rolled back, which
    /// is safe because declaration is idempotent by the backend contract.
    pub fn declare(backend: &dyn MetricsBackend) -> Result<Self, BackendError> {
        Ok(Self {
            requests_total: backend.define_counter(InstrumentSpec {
                name: "requests_total",
                kind: InstrumentKind::Counter,
                tags: TAGS,
                buckets: None,
                unit: None,
                help: "A counter of the total number of HTTP requests processed.",
            })?,
            request_duration: backend.define_histogram(InstrumentSpec {
                name: "request_duration",
                kind: InstrumentKind::Histogram,
                tags: TAGS,
                buckets: Some(LONG_RUNNING_REQUEST_BUCKETS),
                unit: Some(Unit::Seconds),
                help: "A histogram of the response latency.",
            })?,
            view_runtime: backend.define_histogram(InstrumentSpec {
                name: "view_runtime",
                kind: InstrumentKind::Histogram,
                tags: TAGS,
                buckets: Some(LONG_RUNNING_REQUEST_BUCKETS),
                unit: Some(Unit::Seconds),
                help: "A histogram of the view rendering time.",
            })?,
            db_query_count: backend.define_histogram(InstrumentSpec {
                name: "db_query_count",
                kind: InstrumentKind::Histogram,
                tags: TAGS,
                buckets: Some(DB_QUERY_COUNT_BUCKETS),
                unit: None,
                help: "A histogram of DB query count.",
            })?,
            db_runtime: backend.define_histogram(InstrumentSpec {
                name: "db_runtime",
                kind: InstrumentKind::Histogram,
                tags: TAGS,
                buckets: Some(LONG_RUNNING_REQUEST_BUCKETS),
                unit: Some(Unit::Seconds),
                help: "A histogram of DB execution time.",
            })?,
            cpu_time: backend.define_histogram(InstrumentSpec {
                name: "cpu_time",
                kind: InstrumentKind::Histogram,
                tags: TAGS,
                buckets: Some(DEFAULT_BUCKETS),
                unit: None,
                help: "A histogram of CPU time.",
            })?,
        })
    }
}

/// The handler `install` registers: performs the six instrument updates
/// for every observed event.
///
/// Millisecond measurements are converted to seconds; the query count and
/// CPU seconds pass through unchanged. Absent optional measurements are
/// forwarded as `None` and left to the backend.
pub struct InstrumentHandler {
    instruments: RequestInstruments,
}

impl InstrumentHandler {
    /// Wrap declared instruments in the default handler.
    pub fn new(instruments: RequestInstruments) -> Self {
        Self { instruments }
    }
}

impl RequestHandler for InstrumentHandler {
    fn handle(&self, event: &RequestEvent, labels: &LabelSet) -> Result<(), PipelineError> {
        let i = &self.instruments;
        i.requests_total.increment(labels)?;
        i.request_duration
            .observe(labels, Some(ms_to_secs(event.duration_ms)))?;
        i.view_runtime
            .observe(labels, event.view_runtime_ms.map(ms_to_secs))?;
        i.db_query_count
            .observe(labels, event.db_query_count.map(|n| n as f64))?;
        i.db_runtime
            .observe(labels, event.db_runtime_ms.map(ms_to_secs))?;
        i.cpu_time.observe(labels, Some(event.cpu_time))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels;
    use crate::memory::MemoryBackend;
    use serde_json::Map;

    fn event() -> RequestEvent {
        RequestEvent {
            duration_ms: 150.0,
            cpu_time: 0.05,
            controller: "users".to_string(),
            action: "show".to_string(),
            status: 200,
            format: "html".to_string(),
            method: "GET".to_string(),
            view_runtime_ms: Some(20.0),
            db_query_count: Some(3),
            db_runtime_ms: Some(10.0),
            payload: Map::new(),
        }
    }

    #[test]
    fn test_long_running_buckets_extend_the_default_set() {
        assert_eq!(
            &LONG_RUNNING_REQUEST_BUCKETS[..DEFAULT_BUCKETS.len()],
            DEFAULT_BUCKETS
        );
        assert_eq!(
            &LONG_RUNNING_REQUEST_BUCKETS[DEFAULT_BUCKETS.len()..],
            &[30.0, 60.0, 120.0, 300.0, 600.0]
        );
    }

    #[test]
    fn test_buckets_are_ascending() {
        for buckets in [
            DEFAULT_BUCKETS,
            LONG_RUNNING_REQUEST_BUCKETS,
            DB_QUERY_COUNT_BUCKETS,
        ] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_declare_is_idempotent_on_the_memory_backend() {
        let backend = MemoryBackend::new();
        let first = RequestInstruments::declare(&backend).unwrap();
        let second = RequestInstruments::declare(&backend).unwrap();

        let event = event();
        let labels = labels::derive(&event);
        first.requests_total.increment(&labels).unwrap();
        second.requests_total.increment(&labels).unwrap();

        // Both handles point at the same storage.
        assert_eq!(backend.counter_value("requests_total", &labels), 2);
    }

    #[test]
    fn test_default_handler_updates_all_six_instruments() {
        let backend = MemoryBackend::new();
        let handler = InstrumentHandler::new(RequestInstruments::declare(&backend).unwrap());

        let event = event();
        let labels = labels::derive(&event);
        handler.handle(&event, &labels).unwrap();

        assert_eq!(backend.counter_value("requests_total", &labels), 1);
        assert!((backend.observation_sum("request_duration", &labels) - 0.15).abs() < 1e-9);
        assert!((backend.observation_sum("view_runtime", &labels) - 0.02).abs() < 1e-9);
        assert!((backend.observation_sum("db_query_count", &labels) - 3.0).abs() < 1e-9);
        assert!((backend.observation_sum("db_runtime", &labels) - 0.01).abs() < 1e-9);
        assert!((backend.observation_sum("cpu_time", &labels) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_absent_optional_measurements_are_not_recorded() {
        let backend = MemoryBackend::new();
        let handler = InstrumentHandler::new(RequestInstruments::declare(&backend).unwrap());

        let mut event = event();
        event.view_runtime_ms = None;
        event.db_query_count = None;
        event.db_runtime_ms = None;

        let labels = labels::derive(&event);
        handler.handle(&event, &labels).unwrap();

        assert_eq!(backend.counter_value("requests_total", &labels), 1);
        assert_eq!(backend.observation_count("view_runtime", &labels), 0);
        assert_eq!(backend.observation_count("db_query_count", &labels), 0);
        assert_eq!(backend.observation_count("db_runtime", &labels), 0);
        assert_eq!(backend.observation_count("cpu_time", &labels), 1);
    }
}
