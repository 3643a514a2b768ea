//! Error types for the consumer runtime.
//!
//! Only programming-contract violations and transport failures surface as
//! errors here. Decode and handler failures travel as data inside
//! [`AggregateConsumingResult`](crate::result::AggregateConsumingResult).

use warren_core::{ChannelId, CodecError, DeliveryTag, RegistryError};

/// Failures reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("unknown delivery tag {tag} on {channel}")]
    UnknownDeliveryTag { channel: ChannelId, tag: DeliveryTag },
    #[error("transport failure: {0}")]
    Other(String),
}

/// Contract violations and transport failures while replying to the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    /// Acknowledgment is channel-scoped: the reply was issued on a channel
    /// other than the one that delivered the message.
    #[error("delivery {tag} arrived on {expected} but reply was issued on {actual}")]
    ChannelMismatch {
        expected: ChannelId,
        actual: ChannelId,
        tag: DeliveryTag,
    },
    #[error("delivery {tag} on {channel} was already settled or never tracked")]
    AlreadySettled { channel: ChannelId, tag: DeliveryTag },
    #[error("delivery {tag} is already outstanding on {channel}")]
    DuplicateDelivery { channel: ChannelId, tag: DeliveryTag },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised while configuring a broker or connecting it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("queue name must not be empty")]
    EmptyQueue,
    #[error("subscription to {queue} registers no handlers")]
    NoHandlers { queue: String },
    #[error("queue {queue} already has a subscription")]
    DuplicateSubscription { queue: String },
    #[error("retry bound must be at least 1, got {0}")]
    InvalidRetryBound(u32),
    #[error("failed to open channel: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised while publishing on the outbound channel.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("type {type_name} has no registered type binding")]
    Unbound { type_name: &'static str },
    #[error("no codec registered for content type {content_type}")]
    NoCodec { content_type: String },
    #[error("failed to serialize {type_name}: {detail}")]
    Serialize {
        type_name: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("outbound channel is closed")]
    Closed,
}
