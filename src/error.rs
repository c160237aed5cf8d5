//! Error types for the instrumentation pipeline.
//!
//! Three failure kinds exist:
//!
//! - [`MalformedEvent`]: the host delivered an event payload that is missing
//!   a required field or carries the wrong shape. Raised by the decode step
//!   and never recovered here; it propagates to the event source's own
//!   error handling.
//! - [`BackendError`]: an instrument declaration or update failed inside the
//!   metrics backend. Not caught by this crate.
//! - [`PipelineError`]: umbrella for everything the pipeline surface can
//!   return.
//!
//! "Already installed" is deliberately not an error: a second `install`
//! call is a silent no-op. No operation in this crate retries.

use thiserror::Error;

/// The host delivered an event that does not match the expected shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedEvent {
    /// A required payload field is absent (or null).
    #[error("event payload is missing required field `{0}`")]
    MissingField(&'static str),

    /// A payload field is present but has the wrong type.
    #[error("event payload field `{field}` has the wrong type (expected {expected})")]
    WrongType {
        /// Payload field name, dotted for nested fields.
        field: &'static str,
        /// What the decoder expected to find.
        expected: &'static str,
    },

    /// A numeric measurement is NaN or infinite.
    #[error("event measurement `{0}` is not a finite number")]
    NonFinite(&'static str),
}

/// An instrument declaration or update failed in the metrics backend.
#[derive(Debug, Error)]
#[error("metrics backend error: {message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    /// Create a backend error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Any failure the instrumentation pipeline can surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The event could not be decoded.
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),

    /// The metrics backend refused a declaration or update.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A custom handler failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// The event source already has a subscriber.
    #[error("event source already has a subscriber")]
    AlreadySubscribed,
}

impl PipelineError {
    /// Wrap a custom handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}
