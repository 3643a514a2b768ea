//! Codecs and the content-type keyed codec registry.
//!
//! A codec turns bytes into a neutral document (`serde_json::Value`) and back.
//! Typing the document is left to the [`TypeBinding`](crate::binding::TypeBinding)
//! that resolved the wire tag, which keeps codecs independent of the payload
//! types an application registers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::encoding::Encoding;
use crate::error::{CodecError, RegistryError};

/// Well-known content types.
pub mod content_types {
    pub const JSON: &str = "application/json";
    pub const MSGPACK: &str = "application/msgpack";
    pub const X_MSGPACK: &str = "application/x-msgpack";
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Decode/encode strategy for one content type.
///
/// Implementations must be pure: the same bytes and encoding always decode to
/// the same document.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Decodes `body` into a document.
    ///
    /// # Errors
    ///
    /// Returns a `CodecError` for malformed input.
    fn decode(&self, body: &[u8], encoding: Encoding) -> Result<Value, CodecError>;

    /// Encodes `document` into bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if the document cannot be represented.
    fn encode(&self, document: &Value, encoding: Encoding) -> Result<Vec<u8>, CodecError>;

    /// Whether bodies are text in a character encoding. Binary codecs ignore
    /// the encoding, and publishers leave `content_encoding` unset for them.
    fn is_text(&self) -> bool {
        true
    }
}

/// JSON text codec. Honours the delivery's character encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, body: &[u8], encoding: Encoding) -> Result<Value, CodecError> {
        let text = encoding.decode(body)?;
        serde_json::from_str(&text).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode(&self, document: &Value, encoding: Encoding) -> Result<Vec<u8>, CodecError> {
        let text = serde_json::to_string(document).map_err(|e| CodecError::Encode(e.to_string()))?;
        encoding.encode(&text)
    }
}

/// `MsgPack` binary codec using named maps. The text encoding does not apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn decode(&self, body: &[u8], _encoding: Encoding) -> Result<Value, CodecError> {
        rmp_serde::from_slice(body).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    fn encode(&self, document: &Value, _encoding: Encoding) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(document).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn is_text(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// CodecRegistry
// ---------------------------------------------------------------------------

/// Maps a content type to its codec.
///
/// Filled once during setup and then shared read-only, so lookups need no
/// synchronization. Absence is a normal outcome, not an error.
#[derive(Debug, Default, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the JSON codec bound to `application/json`.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut codecs = HashMap::new();
        codecs.insert(content_types::JSON.to_string(), Arc::new(JsonCodec) as Arc<dyn Codec>);
        Self { codecs }
    }

    /// Registers `codec` for `content_type`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateContentType` if a codec is already
    /// registered for the (normalized) content type.
    pub fn register(
        &mut self,
        content_type: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<(), RegistryError> {
        let key = normalize(content_type);
        if key.is_empty() {
            return Err(RegistryError::EmptyContentType);
        }
        if self.codecs.contains_key(&key) {
            return Err(RegistryError::DuplicateContentType { content_type: key });
        }
        self.codecs.insert(key, codec);
        Ok(())
    }

    /// Resolves the codec for `content_type`.
    ///
    /// Matching ignores ASCII case and media-type parameters, so
    /// `Application/JSON; charset=utf-8` resolves the `application/json` codec.
    #[must_use]
    pub fn resolve(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(&normalize(content_type)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_contain_json_only() {
        let registry = CodecRegistry::with_defaults();
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(content_types::JSON).is_some());
        assert!(registry.resolve(content_types::MSGPACK).is_none());
    }

    #[test]
    fn resolve_ignores_case_and_parameters() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.resolve("Application/JSON; charset=utf-8").is_some());
        assert!(registry.resolve(" application/json ").is_some());
        assert!(registry.resolve("text/plain").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CodecRegistry::with_defaults();
        let err = registry
            .register("APPLICATION/JSON", Arc::new(JsonCodec))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateContentType {
                content_type: "application/json".to_string()
            }
        );
    }

    #[test]
    fn empty_content_type_is_rejected() {
        let mut registry = CodecRegistry::new();
        assert_eq!(
            registry.register(" ; charset=x", Arc::new(JsonCodec)),
            Err(RegistryError::EmptyContentType)
        );
    }

    #[test]
    fn json_decode_handles_default_bom() {
        let mut body = vec![0xEF, 0xBB, 0xBF];
        body.extend_from_slice(br#"{"id":1}"#);
        let doc = JsonCodec.decode(&body, Encoding::default()).unwrap();
        assert_eq!(doc, json!({"id": 1}));
    }

    #[test]
    fn json_decode_rejects_garbage() {
        let err = JsonCodec.decode(b"{not json", Encoding::default()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn json_decodes_declared_utf16() {
        let text = r#"{"name":"żółw"}"#;
        let mut bytes = vec![0xFE, 0xFF];
        bytes.extend(text.encode_utf16().flat_map(u16::to_be_bytes));
        let encoding = Encoding::from_label("utf-16be").unwrap();
        assert_eq!(
            JsonCodec.decode(&bytes, encoding).unwrap(),
            json!({"name": "żółw"})
        );
    }

    #[test]
    fn json_encodes_single_byte_charsets() {
        let doc = json!({"name": "café"});
        let encoding = Encoding::from_label("iso-8859-15").unwrap();
        let bytes = JsonCodec.encode(&doc, encoding).unwrap();
        assert_eq!(bytes, b"{\"name\":\"caf\xE9\"}".to_vec());
        assert_eq!(JsonCodec.decode(&bytes, encoding).unwrap(), doc);
    }

    #[test]
    fn only_json_is_text() {
        assert!(JsonCodec.is_text());
        assert!(!MsgPackCodec.is_text());
    }

    #[test]
    fn msgpack_rejects_truncated_input() {
        let bytes = MsgPackCodec.encode(&json!({"a": [1, 2, 3]}), Encoding::default()).unwrap();
        let err = MsgPackCodec
            .decode(&bytes[..bytes.len() - 1], Encoding::default())
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    fn document() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "\\PC{0,16}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn json_round_trips_with_same_encoding(doc in document()) {
            for enc in [Encoding::default(), Encoding::utf8()] {
                let bytes = JsonCodec.encode(&doc, enc).unwrap();
                prop_assert_eq!(JsonCodec.decode(&bytes, enc).unwrap(), doc.clone());
            }
        }

        #[test]
        fn msgpack_round_trips(doc in document()) {
            let bytes = MsgPackCodec.encode(&doc, Encoding::default()).unwrap();
            prop_assert_eq!(MsgPackCodec.decode(&bytes, Encoding::default()).unwrap(), doc);
        }
    }
}
