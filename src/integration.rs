//! axum integration: a middleware that turns every completed response
//! into a raw event for the pipeline.
//!
//! axum has no notification bus to subscribe to, so [`ActionEvents`] is a
//! small source that simply holds the sink handed to it at install time.
//! [`record_action`] times each request, reads the route annotations off
//! the response, and delivers one event per response. Delivery failures
//! are logged, never surfaced to the client.
//!
//! Handlers annotate their responses with [`action`] to get meaningful
//! `controller`/`action` labels, and optionally with [`RequestTimings`]
//! for the view/database/CPU instruments. Unannotated routes fall back to
//! the matched route pattern and the lowercased HTTP method.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Extension, Router};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::PipelineError;
use crate::event::RawActionEvent;
use crate::pipeline::{EventSink, EventSource};

/// The event source for axum applications.
///
/// Clone one instance into both the router (via
/// [`InstrumentedRouter::instrument_requests`]) and
/// [`crate::RequestMetrics::install`]; clones share the sink slot.
#[derive(Clone, Default)]
pub struct ActionEvents {
    sink: Arc<OnceLock<Arc<dyn EventSink>>>,
}

impl ActionEvents {
    /// Create a source with no subscriber yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, raw: RawActionEvent) {
        let Some(sink) = self.sink.get() else {
            // Not installed yet; requests flowing before install are not
            // recorded.
            return;
        };
        if let Err(err) = sink.deliver(raw) {
            error!(error = %err, "failed to record request metrics");
        }
    }
}

impl EventSource for ActionEvents {
    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Result<(), PipelineError> {
        self.sink
            .set(sink)
            .map_err(|_| PipelineError::AlreadySubscribed)
    }
}

/// Response annotation naming the controller and action for the label
/// deriver.
///
/// Returned from a handler as part of the response, e.g.
/// `(action("users", "show"), Json(user))`.
#[derive(Debug, Clone)]
pub struct ControllerAction {
    /// Route group name.
    pub controller: String,
    /// Endpoint name within the group.
    pub action: String,
}

/// Annotate a response with its controller and action.
pub fn action(controller: impl Into<String>, action: impl Into<String>) -> Extension<ControllerAction> {
    Extension(ControllerAction {
        controller: controller.into(),
        action: action.into(),
    })
}

/// Optional per-request measurements, attached to the response as an
/// extension by handlers that track them.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimings {
    /// Time spent rendering the response body, in milliseconds.
    pub view_runtime_ms: Option<f64>,
    /// Database queries issued while serving the request.
    pub db_query_count: Option<u64>,
    /// Time spent executing database queries, in milliseconds.
    pub db_runtime_ms: Option<f64>,
    /// CPU time consumed, in seconds.
    pub cpu_time: Option<f64>,
}

/// Middleware that delivers one event per completed response.
///
/// Runs after routing, so the matched route pattern is available as the
/// controller fallback for unannotated handlers.
pub async fn record_action(
    State(events): State<ActionEvents>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());

    let start = Instant::now();
    let response = next.run(request).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    events.deliver(build_raw_event(&response, method, matched_path, duration_ms));
    response
}

fn build_raw_event(
    response: &Response,
    method: String,
    matched_path: Option<String>,
    duration_ms: f64,
) -> RawActionEvent {
    let annotation = response.extensions().get::<ControllerAction>();
    let controller = annotation
        .map(|a| a.controller.clone())
        .or(matched_path)
        .unwrap_or_else(|| "unmatched".to_string());
    let action = annotation
        .map(|a| a.action.clone())
        .unwrap_or_else(|| method.to_lowercase());

    let format = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(format_label)
        .unwrap_or_else(|| "unknown".to_string());

    let timings = response
        .extensions()
        .get::<RequestTimings>()
        .copied()
        .unwrap_or_default();

    let mut params = Map::new();
    params.insert("controller".to_string(), Value::from(controller));
    params.insert("action".to_string(), Value::from(action));

    let mut payload = Map::new();
    payload.insert("params".to_string(), Value::Object(params));
    payload.insert(
        "status".to_string(),
        Value::from(response.status().as_u16()),
    );
    payload.insert("format".to_string(), Value::from(format));
    payload.insert("method".to_string(), Value::from(method));
    if let Some(view_runtime_ms) = timings.view_runtime_ms {
        payload.insert("view_runtime".to_string(), Value::from(view_runtime_ms));
    }
    if let Some(db_query_count) = timings.db_query_count {
        payload.insert("db_query_count".to_string(), Value::from(db_query_count));
    }
    if let Some(db_runtime_ms) = timings.db_runtime_ms {
        payload.insert("db_runtime".to_string(), Value::from(db_runtime_ms));
    }

    RawActionEvent {
        duration_ms,
        payload,
        cpu_time: timings.cpu_time.unwrap_or(0.0),
    }
}

/// Reduce a content type to a short format label.
///
/// `text/html; charset=utf-8` becomes `html`, `application/vnd.api+json`
/// becomes `json`.
fn format_label(content_type: &str) -> String {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    let subtype = mime.rsplit('/').next().unwrap_or(mime);
    let suffix = subtype.rsplit('+').next().unwrap_or(subtype);
    if suffix.is_empty() {
        "unknown".to_string()
    } else {
        suffix.to_ascii_lowercase()
    }
}

/// Router extension wiring [`record_action`] into an axum service.
pub trait InstrumentedRouter {
    /// Record an event for every request this router serves.
    fn instrument_requests(self, events: ActionEvents) -> Self;
}

impl<S> InstrumentedRouter for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn instrument_requests(self, events: ActionEvents) -> Self {
        self.layer(middleware::from_fn_with_state(events, record_action))
    }
}
