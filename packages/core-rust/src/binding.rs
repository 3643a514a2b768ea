//! Type bindings: wire type tag -> runtime payload type.
//!
//! Registration is explicit. Each binding carries the `TypeId` of the Rust
//! type it materializes plus a closure that turns a decoded document into that
//! type. Lookups return `Option`; there is no sentinel "empty" binding.

use std::any::{self, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CodecError, RegistryError};

type Materialize =
    dyn Fn(Value) -> Result<Arc<dyn Any + Send + Sync>, CodecError> + Send + Sync;

// ---------------------------------------------------------------------------
// TypeBinding
// ---------------------------------------------------------------------------

/// Pairs a wire type tag with the runtime type it decodes into.
#[derive(Clone)]
pub struct TypeBinding {
    tag: Arc<str>,
    type_id: TypeId,
    type_name: &'static str,
    materialize: Arc<Materialize>,
}

impl TypeBinding {
    /// Binds `tag` to `T`.
    #[must_use]
    pub fn of<T>(tag: &str) -> Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let type_name = any::type_name::<T>();
        Self {
            tag: Arc::from(tag),
            type_id: TypeId::of::<T>(),
            type_name,
            materialize: Arc::new(move |document| {
                serde_json::from_value::<T>(document)
                    .map(|value| Arc::new(value) as Arc<dyn Any + Send + Sync>)
                    .map_err(|e| CodecError::TypeMismatch {
                        type_name,
                        detail: e.to_string(),
                    })
            }),
        }
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Converts a decoded document into the bound type.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::TypeMismatch` if the document does not fit the type.
    pub fn materialize(&self, document: Value) -> Result<Payload, CodecError> {
        let value = (self.materialize)(document.clone())?;
        Ok(Payload {
            tag: Arc::clone(&self.tag),
            type_id: self.type_id,
            type_name: self.type_name,
            document,
            value,
        })
    }
}

impl fmt::Debug for TypeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeBinding")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A decoded, typed payload.
///
/// Keeps the decoded document next to the materialized value so two payloads
/// can be compared structurally without requiring `PartialEq` on the
/// application type.
#[derive(Clone)]
pub struct Payload {
    tag: Arc<str>,
    type_id: TypeId,
    type_name: &'static str,
    document: Value,
    value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The decoded document the value was materialized from.
    #[must_use]
    pub fn document(&self) -> &Value {
        &self.document
    }

    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Returns the value as `T` if that is its runtime type.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.type_id == other.type_id && self.document == other.document
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("tag", &self.tag)
            .field("type_name", &self.type_name)
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TypeBindingRegistry
// ---------------------------------------------------------------------------

/// Maps wire type tags to bindings.
///
/// Written during setup, then frozen behind an `Arc` and read concurrently
/// without locking.
#[derive(Debug, Default, Clone)]
pub struct TypeBindingRegistry {
    by_tag: HashMap<Arc<str>, TypeBinding>,
    /// First tag registered for each type; used when publishing.
    tag_by_type: HashMap<TypeId, Arc<str>>,
}

impl TypeBindingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `tag` to `T`.
    ///
    /// A type may be bound under several tags; the first one becomes the tag
    /// stamped on messages of that type when publishing.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::EmptyTag` for a blank tag and
    /// `RegistryError::DuplicateTag` if `tag` is already bound.
    pub fn register<T>(&mut self, tag: &str) -> Result<&TypeBinding, RegistryError>
    where
        T: DeserializeOwned + Serialize + Send + Sync + 'static,
    {
        if tag.trim().is_empty() {
            return Err(RegistryError::EmptyTag);
        }
        if self.by_tag.contains_key(tag) {
            return Err(RegistryError::DuplicateTag {
                tag: tag.to_string(),
            });
        }
        let binding = TypeBinding::of::<T>(tag);
        let key = Arc::clone(&binding.tag);
        self.tag_by_type
            .entry(binding.type_id)
            .or_insert_with(|| Arc::clone(&key));
        tracing::debug!(tag, type_name = binding.type_name, "type binding registered");
        Ok(self.by_tag.entry(key).or_insert(binding))
    }

    /// Resolves the binding for `tag`.
    #[must_use]
    pub fn resolve(&self, tag: &str) -> Option<&TypeBinding> {
        self.by_tag.get(tag)
    }

    /// Returns the publishing tag of `T`, if `T` is bound.
    #[must_use]
    pub fn tag_of<T: Any>(&self) -> Option<&str> {
        self.tag_by_type.get(&TypeId::of::<T>()).map(|tag| &**tag)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u64,
        sku: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderShipped {
        id: u64,
    }

    #[test]
    fn resolve_registered_tag() {
        let mut registry = TypeBindingRegistry::new();
        registry.register::<OrderPlaced>("urn:order-placed").unwrap();

        let binding = registry.resolve("urn:order-placed").unwrap();
        assert_eq!(binding.tag(), "urn:order-placed");
        assert_eq!(binding.type_id(), TypeId::of::<OrderPlaced>());
    }

    #[test]
    fn resolve_unknown_tag_is_absent() {
        let registry = TypeBindingRegistry::new();
        assert!(registry.resolve("urn:nope").is_none());
        assert!(registry.resolve("").is_none());
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut registry = TypeBindingRegistry::new();
        registry.register::<OrderPlaced>("urn:order").unwrap();
        let err = registry.register::<OrderShipped>("urn:order").unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateTag {
                tag: "urn:order".to_string()
            }
        );
    }

    #[test]
    fn empty_tag_is_rejected() {
        let mut registry = TypeBindingRegistry::new();
        assert_eq!(
            registry.register::<OrderPlaced>("  ").unwrap_err(),
            RegistryError::EmptyTag
        );
    }

    #[test]
    fn first_tag_is_publishing_tag() {
        let mut registry = TypeBindingRegistry::new();
        registry.register::<OrderPlaced>("urn:order-placed:v2").unwrap();
        registry.register::<OrderPlaced>("urn:order-placed:v1").unwrap();
        assert_eq!(registry.tag_of::<OrderPlaced>(), Some("urn:order-placed:v2"));
        assert_eq!(registry.tag_of::<OrderShipped>(), None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn materialize_produces_typed_payload() {
        let binding = TypeBinding::of::<OrderPlaced>("urn:order-placed");
        let payload = binding
            .materialize(json!({"id": 7, "sku": "X-1"}))
            .unwrap();

        assert!(payload.is::<OrderPlaced>());
        assert!(!payload.is::<OrderShipped>());
        let order = payload.downcast::<OrderPlaced>().unwrap();
        assert_eq!(*order, OrderPlaced { id: 7, sku: "X-1".to_string() });
        assert!(payload.downcast::<OrderShipped>().is_none());
    }

    #[test]
    fn materialize_reports_type_mismatch() {
        let binding = TypeBinding::of::<OrderPlaced>("urn:order-placed");
        let err = binding.materialize(json!({"id": "seven"})).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn payload_equality_is_structural() {
        let binding = TypeBinding::of::<OrderPlaced>("urn:order-placed");
        let a = binding.materialize(json!({"id": 1, "sku": "A"})).unwrap();
        let b = binding.materialize(json!({"id": 1, "sku": "A"})).unwrap();
        let c = binding.materialize(json!({"id": 2, "sku": "A"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
