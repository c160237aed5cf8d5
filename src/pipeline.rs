//! The instrumentation service: installation, subscription, and the
//! event-to-metric path.
//!
//! [`RequestMetrics`] is an explicit service object, built once at startup
//! and shared behind an `Arc`. It owns the installed flag, the handler
//! chain, and the configured default tags; there is no module-level
//! global state.
//!
//! Control flow per event: the host delivers raw args to
//! [`EventSink::deliver`] → decode → derive labels → merge default tags →
//! dispatch through the handler chain. Everything runs synchronously on
//! the delivering thread; a stalled handler stalls that request.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::backend::MetricsBackend;
use crate::error::PipelineError;
use crate::event::{RawActionEvent, RequestEvent};
use crate::handler::{HandlerChain, RequestHandler};
use crate::instruments::{InstrumentHandler, RequestInstruments};
use crate::labels;
use crate::memory::MemoryBackend;

/// Environment variable read by
/// [`RequestMetricsBuilder::default_tags_from_env`]: comma-separated
/// `key=value` pairs.
pub const DEFAULT_TAGS_ENV: &str = "MILEPOST_DEFAULT_TAGS";

/// Anything that can deliver completed-request events to a sink.
///
/// Notification-style hosts implement this with their own subscribe call;
/// the axum integration ships [`crate::ActionEvents`].
pub trait EventSource {
    /// Register `sink` to receive one call per completed unit of work.
    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Result<(), PipelineError>;
}

/// Receiver for raw events.
///
/// [`RequestMetrics`] is the implementation this crate ships; sources hold
/// it as a trait object so they never depend on the concrete service.
pub trait EventSink: Send + Sync {
    /// Decode and process one raw event, synchronously on the calling
    /// thread.
    fn deliver(&self, raw: RawActionEvent) -> Result<(), PipelineError>;
}

/// The instrumentation service.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use milepost::{EventSink, EventSource, PipelineError, RequestMetrics};
///
/// struct Notifications;
///
/// impl EventSource for Notifications {
///     fn subscribe(&self, _sink: Arc<dyn EventSink>) -> Result<(), PipelineError> {
///         // hand the sink to the host framework here
///         Ok(())
///     }
/// }
///
/// let metrics = Arc::new(RequestMetrics::builder().default_tag("region", "us").build());
/// metrics.install(&Notifications).expect("install");
/// assert!(metrics.is_installed());
/// ```
pub struct RequestMetrics {
    backend: Arc<dyn MetricsBackend>,
    chain: HandlerChain,
    default_tags: BTreeMap<String, String>,
    installed: Mutex<bool>,
}

impl RequestMetrics {
    /// Start building a service.
    pub fn builder() -> RequestMetricsBuilder {
        RequestMetricsBuilder::default()
    }

    /// Create a service with no default tags on the given backend.
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self {
            backend,
            chain: HandlerChain::new(),
            default_tags: BTreeMap::new(),
            installed: Mutex::new(false),
        }
    }

    /// Register an additional handler.
    ///
    /// May be called before or after [`install`](Self::install); newly
    /// registered handlers take effect for all subsequent events. Handlers
    /// registered before install run ahead of the default instrument
    /// updater.
    pub fn on_action(&self, handler: Arc<dyn RequestHandler>) {
        self.chain.register(handler);
    }

    /// One-time setup: declare the six instruments, register the default
    /// handler, and subscribe this service to `source`.
    ///
    /// Idempotent and safe under concurrent callers: the whole sequence
    /// runs inside one lock and executes at most once per service; once
    /// installed, later calls return immediately with no observable
    /// effect.
    ///
    /// # Errors
    ///
    /// Failures propagate and leave the service uninstalled, so a retry is
    /// possible. Instrument declaration is idempotent by the backend
    /// contract, so a retry re-resolves the same instruments. A retry
    /// after a failed subscription registers the default handler a second
    /// time; hosts whose subscribe can fail should treat such an install
    /// error as fatal.
    pub fn install(self: &Arc<Self>, source: &dyn EventSource) -> Result<(), PipelineError> {
        let mut installed = self.installed.lock();
        if *installed {
            return Ok(());
        }

        let instruments = RequestInstruments::declare(self.backend.as_ref())?;
        self.chain.register(Arc::new(InstrumentHandler::new(instruments)));
        source.subscribe(Arc::clone(self) as Arc<dyn EventSink>)?;
        *installed = true;

        info!(
            handlers = self.chain.len(),
            default_tags = self.default_tags.len(),
            "request metrics installed"
        );
        Ok(())
    }

    /// Whether [`install`](Self::install) has completed.
    pub fn is_installed(&self) -> bool {
        *self.installed.lock()
    }

    /// The configured default tags.
    pub fn default_tags(&self) -> &BTreeMap<String, String> {
        &self.default_tags
    }

    /// The backend instruments are declared against.
    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }
}

impl EventSink for RequestMetrics {
    fn deliver(&self, raw: RawActionEvent) -> Result<(), PipelineError> {
        let event = RequestEvent::decode(raw)?;
        let mut labels = labels::derive(&event);
        labels.merge_missing(&self.default_tags);
        self.chain.dispatch(&event, &labels)
    }
}

/// Builder for [`RequestMetrics`].
#[derive(Default)]
pub struct RequestMetricsBuilder {
    backend: Option<Arc<dyn MetricsBackend>>,
    default_tags: BTreeMap<String, String>,
}

impl RequestMetricsBuilder {
    /// Set the metrics backend. Defaults to a fresh
    /// [`MemoryBackend`](crate::MemoryBackend).
    pub fn backend(mut self, backend: Arc<dyn MetricsBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Add one default tag, merged into every event's label set unless the
    /// deriver already produced the key.
    pub fn default_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_tags.insert(key.into(), value.into());
        self
    }

    /// Add default tags from [`DEFAULT_TAGS_ENV`], if set. Tags already
    /// set programmatically win over the environment.
    pub fn default_tags_from_env(mut self) -> Self {
        if let Ok(raw) = env::var(DEFAULT_TAGS_ENV) {
            for (key, value) in labels::parse_tags(&raw) {
                self.default_tags.entry(key).or_insert(value);
            }
        }
        self
    }

    /// Build the service. Not yet installed.
    pub fn build(self) -> RequestMetrics {
        RequestMetrics {
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(MemoryBackend::new())),
            chain: HandlerChain::new(),
            default_tags: self.default_tags,
            installed: Mutex::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MalformedEvent;
    use crate::handler::handler_fn;
    use crate::labels::LabelSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct CountingSource {
        subscriptions: AtomicUsize,
    }

    impl EventSource for CountingSource {
        fn subscribe(&self, _sink: Arc<dyn EventSink>) -> Result<(), PipelineError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSource;

    impl EventSource for FailingSource {
        fn subscribe(&self, _sink: Arc<dyn EventSink>) -> Result<(), PipelineError> {
            Err(PipelineError::AlreadySubscribed)
        }
    }

    fn sample_raw() -> RawActionEvent {
        let payload = serde_json::json!({
            "params": { "controller": "users", "action": "show" },
            "status": 200,
            "format": "html",
            "method": "GET",
            "view_runtime": 20.0,
            "db_query_count": 3,
            "db_runtime": 10.0,
        });
        RawActionEvent {
            duration_ms: 150.0,
            payload: payload.as_object().unwrap().clone(),
            cpu_time: 0.05,
        }
    }

    fn expected_labels() -> LabelSet {
        let mut labels = LabelSet::new();
        labels.insert("controller", "users");
        labels.insert("action", "show");
        labels.insert("status", "200");
        labels.insert("format", "html");
        labels.insert("method", "get");
        labels
    }

    #[test]
    fn test_concurrent_install_runs_once() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(RequestMetrics::builder().backend(backend.clone()).build());
        let source = Arc::new(CountingSource::default());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                let source = Arc::clone(&source);
                thread::spawn(move || metrics.install(source.as_ref()).unwrap())
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(source.subscriptions.load(Ordering::SeqCst), 1);
        assert!(metrics.is_installed());

        // Exactly one default handler: one delivery increments by one.
        metrics.deliver(sample_raw()).unwrap();
        assert_eq!(
            backend.counter_value("requests_total", &expected_labels()),
            1
        );
    }

    #[test]
    fn test_repeated_install_is_a_silent_noop() {
        let metrics = Arc::new(RequestMetrics::builder().build());
        let source = CountingSource::default();

        metrics.install(&source).unwrap();
        metrics.install(&source).unwrap();
        metrics.install(&source).unwrap();

        assert_eq!(source.subscriptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_install_leaves_the_flag_unset() {
        let metrics = Arc::new(RequestMetrics::builder().build());

        let err = metrics.install(&FailingSource).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadySubscribed));
        assert!(!metrics.is_installed());

        // A retry against a working source completes the install.
        metrics.install(&CountingSource::default()).unwrap();
        assert!(metrics.is_installed());
    }

    #[test]
    fn test_end_to_end_scenario() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(RequestMetrics::builder().backend(backend.clone()).build());
        metrics.install(&CountingSource::default()).unwrap();

        metrics.deliver(sample_raw()).unwrap();

        let labels = expected_labels();
        assert_eq!(backend.counter_value("requests_total", &labels), 1);
        assert!((backend.observation_sum("request_duration", &labels) - 0.15).abs() < 1e-9);
        assert!((backend.observation_sum("view_runtime", &labels) - 0.02).abs() < 1e-9);
        assert!((backend.observation_sum("db_query_count", &labels) - 3.0).abs() < 1e-9);
        assert!((backend.observation_sum("db_runtime", &labels) - 0.01).abs() < 1e-9);
        assert!((backend.observation_sum("cpu_time", &labels) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_handlers_registered_before_install_run_first_in_order() {
        let backend = Arc::new(MemoryBackend::new());
        let metrics = Arc::new(RequestMetrics::builder().backend(backend.clone()).build());
        let log: Arc<Mutex<Vec<(&'static str, LabelSet)>>> = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            metrics.on_action(handler_fn(move |_, labels| {
                log.lock().push((name, labels.clone()));
                Ok(())
            }));
        }

        metrics.install(&CountingSource::default()).unwrap();
        metrics.deliver(sample_raw()).unwrap();

        let log = log.lock();
        assert_eq!(log[0].0, "first");
        assert_eq!(log[1].0, "second");
        assert_eq!(log[0].1, log[1].1);
        assert_eq!(log[0].1, expected_labels());
        // The default handler ran after them.
        assert_eq!(
            backend.counter_value("requests_total", &expected_labels()),
            1
        );
    }

    #[test]
    fn test_handlers_registered_after_install_take_effect() {
        let metrics = Arc::new(RequestMetrics::builder().build());
        metrics.install(&CountingSource::default()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        metrics.on_action(handler_fn(move |_, _| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        metrics.deliver(sample_raw()).unwrap();
        metrics.deliver(sample_raw()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_tags_merge_without_collisions() {
        let metrics = Arc::new(
            RequestMetrics::builder()
                .default_tag("status", "override")
                .default_tag("region", "us")
                .build(),
        );
        let seen: Arc<Mutex<Option<LabelSet>>> = Arc::new(Mutex::new(None));

        let seen_in_handler = Arc::clone(&seen);
        metrics.on_action(handler_fn(move |_, labels| {
            *seen_in_handler.lock() = Some(labels.clone());
            Ok(())
        }));
        metrics.install(&CountingSource::default()).unwrap();
        metrics.deliver(sample_raw()).unwrap();

        let labels = seen.lock().clone().unwrap();
        assert_eq!(labels.get("status"), Some("200"));
        assert_eq!(labels.get("region"), Some("us"));
    }

    #[test]
    fn test_malformed_event_propagates() {
        let metrics = Arc::new(RequestMetrics::builder().build());
        metrics.install(&CountingSource::default()).unwrap();

        let mut raw = sample_raw();
        raw.payload.remove("method");

        let err = metrics.deliver(raw).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Malformed(MalformedEvent::MissingField("method"))
        ));
    }

    #[test]
    fn test_default_tags_from_env() {
        env::set_var(DEFAULT_TAGS_ENV, "env=staging,team=platform");
        let metrics = RequestMetrics::builder()
            .default_tag("env", "explicit-wins")
            .default_tags_from_env()
            .build();
        env::remove_var(DEFAULT_TAGS_ENV);

        assert_eq!(
            metrics.default_tags().get("env").map(String::as_str),
            Some("explicit-wins")
        );
        assert_eq!(
            metrics.default_tags().get("team").map(String::as_str),
            Some("platform")
        );
    }
}
