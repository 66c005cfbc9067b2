//! The `Body` sum type.
//!
//! Uses `bytes::Bytes` for zero-copy body sharing. Classification is
//! explicit at the send site: callers pick the variant, never runtime
//! type-sniffing.
//!
//! # Example
//!
//! ```
//! use wiremux::Body;
//!
//! let (bytes, tag) = Body::from("marco").to_wire();
//! assert_eq!(tag, Body::TAG_TEXT);
//! assert_eq!(&bytes[..], b"marco");
//! ```

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::WiremuxError;

/// A frame body, classified per the wire protocol's body-type tags.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body.
    #[default]
    Undefined,
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes, never re-encoded.
    Bytes(Bytes),
    /// A structured JSON value.
    Value(Value),
}

impl Body {
    /// Body-type tag for [`Body::Undefined`].
    pub const TAG_UNDEFINED: u8 = 0;
    /// Body-type tag for [`Body::Text`].
    pub const TAG_TEXT: u8 = 1;
    /// Body-type tag for [`Body::Bytes`].
    pub const TAG_BYTES: u8 = 2;
    /// Body-type tag for [`Body::Value`].
    pub const TAG_VALUE: u8 = 3;

    /// Build a structured body from any serializable value.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Body::Value(serde_json::to_value(value)?))
    }

    /// The body-type tag of this body.
    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            Body::Undefined => Self::TAG_UNDEFINED,
            Body::Text(_) => Self::TAG_TEXT,
            Body::Bytes(_) => Self::TAG_BYTES,
            Body::Value(_) => Self::TAG_VALUE,
        }
    }

    /// Text content, if this is a text body.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The JSON value, if this is a structured body.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Body::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Byte content, if this is an opaque-bytes body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Deserialize the body into a typed value.
    ///
    /// Undefined maps to JSON `null`, text to a JSON string. Opaque byte
    /// bodies cannot be deserialized this way.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        use serde::de::Error;
        match self {
            Body::Undefined => serde_json::from_value(Value::Null),
            Body::Text(s) => serde_json::from_value(Value::String(s.clone())),
            Body::Value(v) => serde_json::from_value(v.clone()),
            Body::Bytes(_) => Err(serde_json::Error::custom(
                "opaque byte body cannot be deserialized as a structured value",
            )),
        }
    }

    /// Serialize the body for the wire: `(body_bytes, body_tag)`.
    pub fn to_wire(&self) -> (Bytes, u8) {
        let tag = self.tag();
        let bytes = match self {
            Body::Undefined => Bytes::new(),
            Body::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            Body::Bytes(b) => b.clone(),
            Body::Value(v) => {
                // Serializing a serde_json::Value cannot fail.
                Bytes::from(serde_json::to_vec(v).expect("JSON serialization should not fail"))
            }
        };
        (bytes, tag)
    }

    /// Rematerialize a body from its wire tag and bytes.
    pub fn from_wire(tag: u64, bytes: Bytes) -> Result<Self, WiremuxError> {
        match tag {
            t if t == Self::TAG_UNDEFINED as u64 => Ok(Body::Undefined),
            t if t == Self::TAG_TEXT as u64 => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|_| WiremuxError::MalformedFrame("text body is not UTF-8".into()))?;
                Ok(Body::Text(text))
            }
            t if t == Self::TAG_BYTES as u64 => Ok(Body::Bytes(bytes)),
            t if t == Self::TAG_VALUE as u64 => {
                let value = serde_json::from_slice(&bytes).map_err(|err| {
                    WiremuxError::MalformedFrame(format!("structured body is not valid JSON: {err}"))
                })?;
                Ok(Body::Value(value))
            }
            other => Err(WiremuxError::MalformedFrame(format!(
                "unknown body-type tag {other}"
            ))),
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_owned())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Body::Value(v)
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}
