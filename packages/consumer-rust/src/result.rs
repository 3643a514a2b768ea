//! Consuming outcomes and their mapping onto broker replies.

use std::sync::Arc;

use warren_core::CodecError;

// ---------------------------------------------------------------------------
// ConsumingError
// ---------------------------------------------------------------------------

/// Why consuming a delivery failed.
///
/// Cloneable so that the attempt store can keep the error history of a
/// message across redeliveries.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConsumingError {
    #[error("no type binding for message type {tag:?}")]
    Unresolved { tag: Option<String> },
    #[error("no codec for content type {content_type:?}")]
    Unsupported { content_type: Option<String> },
    #[error("corrupted payload: {reason}")]
    Corrupted { reason: CodecError },
    #[error("no handler registered for {type_name}")]
    Unhandled { type_name: &'static str },
    #[error("handler {handler} failed: {error:#}")]
    Handler {
        handler: &'static str,
        error: Arc<anyhow::Error>,
    },
}

impl ConsumingError {
    /// Wraps a handler failure.
    #[must_use]
    pub fn handler(handler: &'static str, error: anyhow::Error) -> Self {
        Self::Handler {
            handler,
            error: Arc::new(error),
        }
    }

    /// Terminal errors cannot succeed on redelivery: the same bytes, tag and
    /// handler set will fail the same way.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Unresolved { .. }
            | Self::Unsupported { .. }
            | Self::Corrupted { .. }
            | Self::Unhandled { .. } => true,
            Self::Handler { .. } => false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unresolved { .. } => "unresolved",
            Self::Unsupported { .. } => "unsupported",
            Self::Corrupted { .. } => "corrupted",
            Self::Unhandled { .. } => "unhandled",
            Self::Handler { .. } => "handler",
        }
    }
}

// ---------------------------------------------------------------------------
// AggregateConsumingResult
// ---------------------------------------------------------------------------

/// Outcome of consuming one delivery. Every delivery yields exactly one.
#[derive(Debug, Clone)]
pub enum AggregateConsumingResult {
    /// Every matching handler completed.
    Success,
    /// A retryable failure: the delivery goes back to the queue.
    ConsumingFailure { errors: Vec<ConsumingError> },
    /// A terminal failure: the delivery is acknowledged so it leaves the
    /// queue, and the errors go to the failure reporter.
    ReiteratedConsumingFailure { errors: Vec<ConsumingError> },
}

impl AggregateConsumingResult {
    /// The broker reply this result calls for.
    #[must_use]
    pub fn action(&self) -> ReplyAction {
        match self {
            Self::Success | Self::ReiteratedConsumingFailure { .. } => ReplyAction::Ack,
            Self::ConsumingFailure { .. } => ReplyAction::Requeue,
        }
    }

    #[must_use]
    pub fn errors(&self) -> &[ConsumingError] {
        match self {
            Self::Success => &[],
            Self::ConsumingFailure { errors } | Self::ReiteratedConsumingFailure { errors } => {
                errors
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::ReiteratedConsumingFailure { .. })
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ConsumingFailure { .. } => "retry",
            Self::ReiteratedConsumingFailure { .. } => "dropped",
        }
    }
}

/// Acknowledgment action issued on the originating channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    /// Positive acknowledgment: the message leaves the queue.
    Ack,
    /// Negative acknowledgment with requeue.
    Requeue,
    /// A copy went back to the queue under a fresh message id; the original
    /// is acknowledged.
    Republish,
}

impl ReplyAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::Republish => "republish",
        }
    }
}
