//! Classified deliveries.

use std::sync::Arc;

use warren_core::{CodecError, Delivery, Payload};

use crate::result::{AggregateConsumingResult, ConsumingError};

/// The classification of one delivery. Exactly one variant applies.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumedMessage {
    /// Tag known, content type supported, decode succeeded.
    Resolved {
        delivery: Arc<Delivery>,
        payload: Payload,
    },
    /// The type tag has no binding.
    Unresolved { delivery: Arc<Delivery> },
    /// The tag resolved but no codec handles the content type.
    Unsupported { delivery: Arc<Delivery> },
    /// Tag and content type resolved but decoding failed.
    Corrupted {
        delivery: Arc<Delivery>,
        reason: CodecError,
    },
}

impl ConsumedMessage {
    #[must_use]
    pub fn delivery(&self) -> &Arc<Delivery> {
        match self {
            Self::Resolved { delivery, .. }
            | Self::Unresolved { delivery }
            | Self::Unsupported { delivery }
            | Self::Corrupted { delivery, .. } => delivery,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolved { .. } => "resolved",
            Self::Unresolved { .. } => "unresolved",
            Self::Unsupported { .. } => "unsupported",
            Self::Corrupted { .. } => "corrupted",
        }
    }

    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Resolved { payload, .. } => Some(payload),
            Self::Unresolved { .. } | Self::Unsupported { .. } | Self::Corrupted { .. } => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Resolved { .. })
    }

    /// The error a terminal classification stands for.
    #[must_use]
    pub fn terminal_error(&self) -> Option<ConsumingError> {
        match self {
            Self::Resolved { .. } => None,
            Self::Unresolved { delivery } => Some(ConsumingError::Unresolved {
                tag: delivery.message_type().map(str::to_owned),
            }),
            Self::Unsupported { delivery } => Some(ConsumingError::Unsupported {
                content_type: delivery.content_type().map(str::to_owned),
            }),
            Self::Corrupted { reason, .. } => Some(ConsumingError::Corrupted {
                reason: reason.clone(),
            }),
        }
    }

    /// Consuming a terminal classification never reaches a handler: it is a
    /// non-retryable failure straight away. `None` for resolved messages.
    #[must_use]
    pub fn terminal_failure(&self) -> Option<AggregateConsumingResult> {
        self.terminal_error()
            .map(|error| AggregateConsumingResult::ReiteratedConsumingFailure {
                errors: vec![error],
            })
    }
}
