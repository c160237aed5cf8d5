//! The handler chain: ordered fan-out of decoded events.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::PipelineError;
use crate::event::RequestEvent;
use crate::labels::LabelSet;

/// A hook invoked with every decoded event and its derived label set.
///
/// The default instrument updater registered by install is one of these;
/// applications register their own for custom side effects. For simple
/// hooks, [`handler_fn`] adapts a closure.
pub trait RequestHandler: Send + Sync {
    /// Process one event. Runs synchronously on the thread that delivered
    /// the event.
    fn handle(&self, event: &RequestEvent, labels: &LabelSet) -> Result<(), PipelineError>;
}

struct FnHandler<F>(F);

impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&RequestEvent, &LabelSet) -> Result<(), PipelineError> + Send + Sync,
{
    fn handle(&self, event: &RequestEvent, labels: &LabelSet) -> Result<(), PipelineError> {
        (self.0)(event, labels)
    }
}

/// Adapt a closure into a registrable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(&RequestEvent, &LabelSet) -> Result<(), PipelineError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Append-only, ordered collection of handlers.
///
/// Registration may race dispatch (startup code can still be registering
/// handlers while requests are already flowing), so dispatch works on a
/// snapshot taken under a read lock. Handlers are never removed;
/// registration order is invocation order.
#[derive(Default)]
pub struct HandlerChain {
    handlers: RwLock<Vec<Arc<dyn RequestHandler>>>,
}

impl HandlerChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. Never fails.
    pub fn register(&self, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().push(handler);
    }

    /// Invoke every handler in registration order, passing the same event
    /// and label set to each.
    ///
    /// The first handler error aborts the rest of the chain and propagates
    /// to the event source. A handler that must not stop the chain catches
    /// its own failures.
    pub fn dispatch(&self, event: &RequestEvent, labels: &LabelSet) -> Result<(), PipelineError> {
        let snapshot: Vec<Arc<dyn RequestHandler>> = self.handlers.read().clone();
        for handler in &snapshot {
            handler.handle(event, labels)?;
        }
        Ok(())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
