//! Message classification: converts a raw `Delivery` into a `ConsumedMessage`.

use std::sync::Arc;

use warren_core::{CodecError, CodecRegistry, Delivery, Encoding, Payload, TypeBindingRegistry};

use crate::message::ConsumedMessage;

// ---------------------------------------------------------------------------
// MessageClassifier
// ---------------------------------------------------------------------------

/// Classifies deliveries using the frozen type-binding and codec registries.
///
/// Classification is pure: it never invokes handlers, never mutates the
/// registries, and never lets a decode error escape. Resolution short-circuits
/// in order: type tag, then content type, then decode.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    bindings: Arc<TypeBindingRegistry>,
    codecs: Arc<CodecRegistry>,
}

impl MessageClassifier {
    #[must_use]
    pub fn new(bindings: Arc<TypeBindingRegistry>, codecs: Arc<CodecRegistry>) -> Self {
        Self { bindings, codecs }
    }

    #[must_use]
    pub fn bindings(&self) -> &Arc<TypeBindingRegistry> {
        &self.bindings
    }

    #[must_use]
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }

    /// Classify a delivery.
    ///
    /// - unknown or missing type tag -> `Unresolved`
    /// - unknown or missing content type -> `Unsupported`
    /// - unknown encoding label, malformed bytes, or a document that does not
    ///   fit the bound type -> `Corrupted`
    /// - otherwise `Resolved`
    #[must_use]
    pub fn classify(&self, delivery: Arc<Delivery>) -> ConsumedMessage {
        let Some(binding) = delivery.message_type().and_then(|tag| self.bindings.resolve(tag))
        else {
            tracing::warn!(
                message_type = ?delivery.message_type(),
                message_id = ?delivery.message_id(),
                "unresolved message type"
            );
            return ConsumedMessage::Unresolved { delivery };
        };

        let Some(codec) = delivery.content_type().and_then(|ct| self.codecs.resolve(ct)) else {
            tracing::warn!(
                message_type = binding.tag(),
                content_type = ?delivery.content_type(),
                message_id = ?delivery.message_id(),
                "unsupported content type"
            );
            return ConsumedMessage::Unsupported { delivery };
        };

        let decoded: Result<Payload, CodecError> = encoding_of(&delivery)
            .and_then(|encoding| codec.decode(delivery.body(), encoding))
            .and_then(|document| binding.materialize(document));

        match decoded {
            Ok(payload) => {
                tracing::debug!(
                    message_type = binding.tag(),
                    type_name = binding.type_name(),
                    message_id = ?delivery.message_id(),
                    "message resolved"
                );
                ConsumedMessage::Resolved { delivery, payload }
            }
            Err(reason) => {
                tracing::warn!(
                    message_type = binding.tag(),
                    message_id = ?delivery.message_id(),
                    error = %reason,
                    "corrupted message"
                );
                ConsumedMessage::Corrupted { delivery, reason }
            }
        }
    }
}

/// The declared encoding, or UTF-8 with BOM emission when none is declared.
fn encoding_of(delivery: &Delivery) -> Result<Encoding, CodecError> {
    delivery
        .content_encoding()
        .map_or(Ok(Encoding::default()), Encoding::from_label)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
