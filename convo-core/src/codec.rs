//! Payload codecs: typed values to and from message bodies.
//!
//! Channels and endpoints move opaque bytes; a [`Codec`] is applied only by the typed helpers
//! (`send_object` / `recv_object`). The codec's name travels in the `encoding` header so the
//! receiver picks the matching decoder.

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation failed: {0}")]
    Invalid(String),
    #[error("unknown encoding {0:?}")]
    UnknownEncoding(String),
}

pub trait Codec {
    /// Value for the `encoding` header.
    fn encoding(&self) -> &'static str;

    /// Value for the `format` header.
    fn format(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// Compact binary payloads. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for BincodeCodec {
    fn encoding(&self) -> &'static str {
        "bincode"
    }

    fn format(&self) -> &'static str {
        "binary"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

impl Codec for JsonCodec {
    fn encoding(&self) -> &'static str {
        "json"
    }

    fn format(&self) -> &'static str {
        "text"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Application-level check run after decoding.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Decode with whichever codec `encoding` names. No encoding means bincode.
pub fn decode_with_encoding<T: DeserializeOwned>(
    encoding: Option<&str>,
    bytes: &[u8],
) -> Result<T, CodecError> {
    match encoding {
        None | Some("bincode") => BincodeCodec.decode(bytes),
        Some("json") => JsonCodec.decode(bytes),
        Some(other) => Err(CodecError::UnknownEncoding(other.to_string())),
    }
}

pub fn decode_validated<T: DeserializeOwned + Validate>(
    encoding: Option<&str>,
    bytes: &[u8],
) -> Result<T, CodecError> {
    let value: T = decode_with_encoding(encoding, bytes)?;
    value.validate().map_err(CodecError::Invalid)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        item: String,
        qty: u32,
    }

    impl Validate for Order {
        fn validate(&self) -> Result<(), String> {
            if self.qty == 0 {
                Err("qty must be positive".into())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn encoding_header_selects_decoder() {
        let order = Order {
            item: "tea".into(),
            qty: 2,
        };
        let json = JsonCodec.encode(&order).unwrap();
        assert_eq!(
            decode_with_encoding::<Order>(Some("json"), &json).unwrap(),
            order
        );
        let bin = BincodeCodec.encode(&order).unwrap();
        assert_eq!(decode_with_encoding::<Order>(None, &bin).unwrap(), order);
        assert!(matches!(
            decode_with_encoding::<Order>(Some("xml"), &bin),
            Err(CodecError::UnknownEncoding(_))
        ));
    }

    #[test]
    fn validation_runs_after_decode() {
        let bad = JsonCodec
            .encode(&Order {
                item: "tea".into(),
                qty: 0,
            })
            .unwrap();
        assert!(matches!(
            decode_validated::<Order>(Some("json"), &bad),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            JsonCodec.decode::<Order>(b"{not json"),
            Err(CodecError::Decode(_))
        ));
    }
}
