//! Character encodings used by text codecs.
//!
//! Labels resolve through the WHATWG Encoding Standard (`encoding_rs`), so a
//! delivery may declare any label a browser understands: `utf-8`,
//! `windows-1252`, `iso-8859-15`, `shift_jis`, `utf-16le` and so on.
//!
//! A delivery without a `content_encoding` label is read as UTF-8 with
//! byte-order-mark emission: encoding prepends the `EF BB BF` preamble and
//! decoding strips it. An explicit label never emits a preamble.

use crate::error::CodecError;

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Text encoding applied by text codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Encoding {
    charset: &'static encoding_rs::Encoding,
    emit_bom: bool,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::utf8_with_bom()
    }
}

impl Encoding {
    /// UTF-8 without a preamble.
    #[must_use]
    pub fn utf8() -> Self {
        Self {
            charset: encoding_rs::UTF_8,
            emit_bom: false,
        }
    }

    /// UTF-8 that writes the `EF BB BF` preamble in front of encoded text.
    #[must_use]
    pub fn utf8_with_bom() -> Self {
        Self {
            charset: encoding_rs::UTF_8,
            emit_bom: true,
        }
    }

    /// Resolves an encoding label as found in the `content_encoding` property.
    ///
    /// Matching ignores ASCII case and surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::UnknownEncoding` for labels the Encoding Standard
    /// does not define, and for the labels it maps to the `replacement`
    /// encoding.
    pub fn from_label(label: &str) -> Result<Self, CodecError> {
        encoding_rs::Encoding::for_label_no_replacement(label.trim().as_bytes())
            .map(|charset| Self {
                charset,
                emit_bom: false,
            })
            .ok_or_else(|| CodecError::UnknownEncoding {
                label: label.to_string(),
            })
    }

    /// Canonical name, suitable for a `content_encoding` property.
    #[must_use]
    pub fn label(self) -> &'static str {
        self.charset.name()
    }

    /// Whether text can be written in this encoding. UTF-16 is decode-only.
    #[must_use]
    pub fn can_encode(self) -> bool {
        self.charset.output_encoding() == self.charset
    }

    /// Byte-order mark written in front of encoded text, if any.
    #[must_use]
    pub fn preamble(self) -> &'static [u8] {
        if self.emit_bom {
            &UTF8_BOM
        } else {
            &[]
        }
    }

    /// Encodes `text`, prefixed with the preamble.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` for decode-only encodings and when `text`
    /// contains characters the encoding cannot represent.
    pub fn encode(self, text: &str) -> Result<Vec<u8>, CodecError> {
        if !self.can_encode() {
            return Err(CodecError::Encode(format!(
                "{} cannot be used to encode text",
                self.label()
            )));
        }
        let (bytes, _, unmappable) = self.charset.encode(text);
        if unmappable {
            return Err(CodecError::Encode(format!(
                "text is not representable in {}",
                self.label()
            )));
        }
        let preamble = self.preamble();
        let mut out = Vec::with_capacity(preamble.len() + bytes.len());
        out.extend_from_slice(preamble);
        out.extend_from_slice(&bytes);
        Ok(out)
    }

    /// Decodes `bytes`, stripping a leading byte-order mark that matches the
    /// encoding.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::InvalidText` for malformed input.
    pub fn decode(self, bytes: &[u8]) -> Result<String, CodecError> {
        let (text, malformed) = self.charset.decode_with_bom_removal(bytes);
        if malformed {
            return Err(CodecError::InvalidText {
                encoding: self.label(),
                detail: "malformed byte sequence".to_string(),
            });
        }
        Ok(text.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn default_is_utf8_with_bom() {
        assert_eq!(Encoding::default(), Encoding::utf8_with_bom());
        let bytes = Encoding::default().encode("hi").unwrap();
        assert_eq!(bytes, vec![0xEF, 0xBB, 0xBF, b'h', b'i']);
    }

    #[test]
    fn explicit_utf8_label_has_no_preamble() {
        let enc = Encoding::from_label(" UTF-8 ").unwrap();
        assert_eq!(enc, Encoding::utf8());
        assert_eq!(enc.label(), "UTF-8");
        assert_eq!(enc.encode("hi").unwrap(), b"hi".to_vec());
    }

    #[test]
    fn decode_strips_bom_and_accepts_plain_utf8() {
        let enc = Encoding::default();
        assert_eq!(enc.decode(&[0xEF, 0xBB, 0xBF, b'o', b'k']).unwrap(), "ok");
        assert_eq!(enc.decode(b"ok").unwrap(), "ok");
    }

    #[test]
    fn legacy_labels_resolve() {
        for (label, name) in [
            ("windows-1252", "windows-1252"),
            ("cp1252", "windows-1252"),
            ("latin1", "windows-1252"),
            ("iso-8859-15", "ISO-8859-15"),
            ("Shift_JIS", "Shift_JIS"),
            ("utf-16", "UTF-16LE"),
        ] {
            assert_eq!(Encoding::from_label(label).unwrap().label(), name, "{label}");
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        for label in ["klingon", "utf-32", "iso-2022-kr"] {
            let err = Encoding::from_label(label).unwrap_err();
            assert!(matches!(err, CodecError::UnknownEncoding { label: l } if l == label));
        }
    }

    #[test]
    fn windows_1252_maps_high_bytes() {
        let enc = Encoding::from_label("windows-1252").unwrap();
        let bytes = enc.encode("café").unwrap();
        assert_eq!(bytes, vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(enc.decode(&bytes).unwrap(), "café");
        assert!(enc.encode("日本").is_err());
    }

    #[test]
    fn shift_jis_round_trips() {
        let enc = Encoding::from_label("shift_jis").unwrap();
        let bytes = enc.encode("日本").unwrap();
        assert_eq!(bytes, vec![0x93, 0xFA, 0x96, 0x7B]);
        assert_eq!(enc.decode(&bytes).unwrap(), "日本");
    }

    #[test]
    fn utf16_is_decode_only() {
        let enc = Encoding::from_label("utf-16be").unwrap();
        assert!(!enc.can_encode());
        assert!(matches!(enc.encode("x"), Err(CodecError::Encode(_))));
        assert_eq!(enc.decode(&[0xFE, 0xFF, 0x00, 0x6F, 0x00, 0x6B]).unwrap(), "ok");
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let err = Encoding::default().decode(&[0xC3, 0x28]).unwrap_err();
        assert!(matches!(err, CodecError::InvalidText { encoding: "UTF-8", .. }));
    }

    #[test]
    fn odd_length_utf16_is_reported() {
        let enc = Encoding::from_label("utf-16le").unwrap();
        assert!(enc.decode(&[0x41]).is_err());
    }

    proptest! {
        #[test]
        fn unicode_encodings_round_trip(text in "\\PC*") {
            for enc in [Encoding::default(), Encoding::utf8()] {
                let bytes = enc.encode(&text).unwrap();
                prop_assert_eq!(enc.decode(&bytes).unwrap(), text.clone());
            }
        }

        #[test]
        fn latin_text_round_trips_through_windows_1252(text in "[ -~\u{A0}-\u{FF}]*") {
            let enc = Encoding::from_label("windows-1252").unwrap();
            let bytes = enc.encode(&text).unwrap();
            prop_assert_eq!(bytes.len(), text.chars().count());
            prop_assert_eq!(enc.decode(&bytes).unwrap(), text);
        }
    }
}
