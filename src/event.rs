//! Completed-request events.
//!
//! The host framework delivers one raw event per finished unit of work: a
//! wall-clock duration in milliseconds, a loosely shaped payload mapping,
//! and CPU seconds. [`RequestEvent::decode`] turns that into a
//! strongly-typed record up front, failing fast with [`MalformedEvent`]
//! instead of letting a missing key surface as a null deep inside a
//! handler.
//!
//! Events are read-only after decoding and live for the duration of one
//! dispatch.

use serde_json::{Map, Value};

use crate::error::MalformedEvent;

/// Raw event arguments exactly as the host delivered them.
#[derive(Debug, Clone)]
pub struct RawActionEvent {
    /// Wall-clock time of the unit of work, in milliseconds.
    pub duration_ms: f64,
    /// Host-provided payload mapping. Must contain a `params` object with
    /// `controller` and `action`, plus `status`, `format` and `method`;
    /// `view_runtime`, `db_query_count` and `db_runtime` are optional.
    pub payload: Map<String, Value>,
    /// CPU time consumed by the unit of work, in seconds.
    pub cpu_time: f64,
}

/// A validated completed-request event.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    /// Wall-clock time of the unit of work, in milliseconds.
    pub duration_ms: f64,
    /// CPU time consumed, in seconds.
    pub cpu_time: f64,
    /// Controller (route group) that handled the request.
    pub controller: String,
    /// Action (route endpoint) that handled the request.
    pub action: String,
    /// HTTP response status code.
    pub status: u16,
    /// Response format, e.g. `html` or `json`.
    pub format: String,
    /// HTTP method exactly as delivered; label derivation lowercases it.
    pub method: String,
    /// View rendering time in milliseconds, when the host tracked it.
    pub view_runtime_ms: Option<f64>,
    /// Number of database queries issued, when the host tracked it.
    pub db_query_count: Option<u64>,
    /// Database execution time in milliseconds, when the host tracked it.
    pub db_runtime_ms: Option<f64>,
    /// The full raw payload, kept for custom handlers.
    pub payload: Map<String, Value>,
}

impl RequestEvent {
    /// Decode and validate a raw event.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEvent`] if a required field is absent or has the
    /// wrong type, or if a measurement is NaN/infinite. Optional fields may
    /// be absent or null, but when present they must carry the right type.
    pub fn decode(raw: RawActionEvent) -> Result<Self, MalformedEvent> {
        if !raw.duration_ms.is_finite() {
            return Err(MalformedEvent::NonFinite("duration"));
        }
        if !raw.cpu_time.is_finite() {
            return Err(MalformedEvent::NonFinite("cpu_time"));
        }

        let params = match raw.payload.get("params") {
            None | Some(Value::Null) => return Err(MalformedEvent::MissingField("params")),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(MalformedEvent::WrongType {
                    field: "params",
                    expected: "object",
                })
            }
        };

        let controller = required_str(params, "controller", "params.controller")?;
        let action = required_str(params, "action", "params.action")?;
        let status = required_status(&raw.payload)?;
        let format = required_str(&raw.payload, "format", "format")?;
        let method = required_str(&raw.payload, "method", "method")?;
        let view_runtime_ms = optional_f64(&raw.payload, "view_runtime")?;
        let db_query_count = optional_u64(&raw.payload, "db_query_count")?;
        let db_runtime_ms = optional_f64(&raw.payload, "db_runtime")?;

        Ok(Self {
            duration_ms: raw.duration_ms,
            cpu_time: raw.cpu_time,
            controller,
            action,
            status,
            format,
            method,
            view_runtime_ms,
            db_query_count,
            db_runtime_ms,
            payload: raw.payload,
        })
    }
}

fn required_str(
    map: &Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<String, MalformedEvent> {
    match map.get(key) {
        None | Some(Value::Null) => Err(MalformedEvent::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(MalformedEvent::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn required_status(map: &Map<String, Value>) -> Result<u16, MalformedEvent> {
    match map.get("status") {
        None | Some(Value::Null) => Err(MalformedEvent::MissingField("status")),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or(MalformedEvent::WrongType {
                field: "status",
                expected: "HTTP status code",
            }),
        Some(_) => Err(MalformedEvent::WrongType {
            field: "status",
            expected: "number",
        }),
    }
}

fn optional_f64(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<f64>, MalformedEvent> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let value = n.as_f64().filter(|v| v.is_finite());
            value.map(Some).ok_or(MalformedEvent::NonFinite(field))
        }
        Some(_) => Err(MalformedEvent::WrongType {
            field,
            expected: "number",
        }),
    }
}

fn optional_u64(
    map: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<u64>, MalformedEvent> {
    match map.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or(MalformedEvent::WrongType {
                field,
                expected: "non-negative integer",
            }),
        Some(_) => Err(MalformedEvent::WrongType {
            field,
            expected: "non-negative integer",
        }),
    }
}
