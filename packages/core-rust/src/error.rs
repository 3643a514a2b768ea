/// Errors raised while turning bytes into a typed value (or back).
///
/// Decode failures never cross the classifier as errors; they become the
/// `Corrupted` classification. The type is `Clone` so the reason can travel
/// with the classified message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown content encoding: {label}")]
    UnknownEncoding { label: String },
    #[error("payload is not valid {encoding}: {detail}")]
    InvalidText {
        encoding: &'static str,
        detail: String,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload does not match type {type_name}: {detail}")]
    TypeMismatch {
        type_name: &'static str,
        detail: String,
    },
    #[error("encoding failed: {0}")]
    Encode(String),
}

/// Setup-time registration errors. These are programming contract violations
/// and are surfaced before any consumption starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("type tag must not be empty")]
    EmptyTag,
    #[error("type tag already bound: {tag}")]
    DuplicateTag { tag: String },
    #[error("content type must not be empty")]
    EmptyContentType,
    #[error("codec already registered for content type: {content_type}")]
    DuplicateContentType { content_type: String },
}
