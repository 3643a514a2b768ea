//! Dispatch of resolved messages to handlers, as a Tower service stack.
//!
//! ```text
//! InstrumentLayer -> HandlerRouter -> handler futures (concurrent)
//! ```

pub mod instrument;
pub mod router;

use std::sync::Arc;

use tower::Layer;
use warren_core::{Delivery, Payload};

use crate::handler::HandlerSet;
use crate::result::ConsumingError;

pub use instrument::{InstrumentLayer, InstrumentService};
pub use router::HandlerRouter;

/// A resolved message on its way to the handlers of one subscription.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub queue: Arc<str>,
    pub delivery: Arc<Delivery>,
    pub payload: Payload,
    /// One-based attempt number.
    pub attempt: u32,
}

/// What happened when a dispatch ran.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Number of handlers that were started.
    pub invoked: usize,
    /// One entry per failed handler, or a single `Unhandled` when no handler
    /// accepts the payload type.
    pub errors: Vec<ConsumingError>,
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether the payload had no handler at all.
    #[must_use]
    pub fn is_unhandled(&self) -> bool {
        self.invoked == 0 && !self.errors.is_empty()
    }
}

/// The full dispatch stack used by consumers.
pub type DispatchPipeline = InstrumentService<HandlerRouter>;

/// Builds the dispatch stack for a handler set.
#[must_use]
pub fn build_pipeline(handlers: Arc<HandlerSet>) -> DispatchPipeline {
    InstrumentLayer.layer(HandlerRouter::new(handlers))
}
