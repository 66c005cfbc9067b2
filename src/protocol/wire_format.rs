//! Wire format framing and frame-type tags.
//!
//! ```text
//! ┌────────────────┬─────────────────────────┬───────────────┐
//! │ header_len     │ header JSON array       │ body bytes    │
//! │ 4 bytes, u32 BE│ header_len bytes, UTF-8 │ rest of frame │
//! └────────────────┴─────────────────────────┴───────────────┘
//! ```
//!
//! `header_len` covers the header JSON only; the body is the unprefixed
//! suffix of the frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;

use crate::codec::Body;
use crate::error::WiremuxError;

/// Size of the big-endian length prefix.
pub const HEADER_LEN_SIZE: usize = 4;

/// Default maximum accepted header length (1 MiB).
pub const DEFAULT_MAX_HEADER_LEN: u32 = 1024 * 1024;

/// Request frame-type tags (client -> server within one peer pair).
pub const REQ_PROMISE: u64 = 100;
pub const REQ_PROMISE_CANCEL: u64 = 101;
pub const REQ_EVENT_LISTEN: u64 = 102;
pub const REQ_EVENT_DISPOSE: u64 = 103;

/// Response frame-type tags (server -> client).
pub const RES_INITIALIZE: u64 = 200;
pub const RES_PROMISE_SUCCESS: u64 = 201;
pub const RES_PROMISE_ERROR: u64 = 202;
pub const RES_PROMISE_ERROR_OBJ: u64 = 203;
pub const RES_EVENT_FIRE: u64 = 204;

/// Decode-side limits.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolLimits {
    /// Maximum accepted header length in bytes.
    pub max_header_len: u32,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_header_len: DEFAULT_MAX_HEADER_LEN,
        }
    }
}

/// Assemble a frame: append the body tag to the header elements, serialize,
/// length-prefix, and concatenate the body bytes.
pub(crate) fn encode_frame(mut header: Vec<Value>, body: &Body) -> Bytes {
    let (body_bytes, tag) = body.to_wire();
    header.push(Value::from(tag));

    // Serializing an array of numbers and strings cannot fail.
    let header_bytes =
        serde_json::to_vec(&Value::Array(header)).expect("JSON serialization should not fail");

    let mut buf = BytesMut::with_capacity(HEADER_LEN_SIZE + header_bytes.len() + body_bytes.len());
    buf.put_u32(header_bytes.len() as u32);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&body_bytes);
    buf.freeze()
}

/// Split a frame into header elements (body tag stripped), the body tag,
/// and the body bytes.
pub(crate) fn split_frame(
    frame: &Bytes,
    limits: &ProtocolLimits,
) -> Result<(Vec<Value>, u64, Bytes), WiremuxError> {
    if frame.len() < HEADER_LEN_SIZE {
        return Err(WiremuxError::MalformedFrame(
            "frame shorter than length prefix".into(),
        ));
    }

    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    if header_len > limits.max_header_len {
        return Err(WiremuxError::MalformedFrame(format!(
            "header length {} exceeds maximum {}",
            header_len, limits.max_header_len
        )));
    }

    let header_end = HEADER_LEN_SIZE + header_len as usize;
    if frame.len() < header_end {
        return Err(WiremuxError::MalformedFrame(
            "header length exceeds frame size".into(),
        ));
    }

    let header: Value = serde_json::from_slice(&frame[HEADER_LEN_SIZE..header_end])
        .map_err(|err| WiremuxError::MalformedFrame(format!("header is not valid JSON: {err}")))?;

    let mut elements = match header {
        Value::Array(elements) => elements,
        _ => {
            return Err(WiremuxError::MalformedFrame(
                "header is not a JSON array".into(),
            ))
        }
    };

    if elements.len() < 2 {
        return Err(WiremuxError::MalformedFrame(
            "header array has fewer than two elements".into(),
        ));
    }

    let body_tag = elements
        .pop()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| WiremuxError::MalformedFrame("body tag is not an integer".into()))?;

    // Zero-copy slice of the body suffix.
    let body = frame.slice(header_end..);

    Ok((elements, body_tag, body))
}
