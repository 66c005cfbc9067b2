//! Typed request and response messages with frame encode/decode.
//!
//! Header array shapes:
//!
//! - `[100, id, channel, name, body_tag]` - Promise
//! - `[101, id, body_tag]` - PromiseCancel
//! - `[102, id, channel, name, body_tag]` - EventListen
//! - `[103, id, body_tag]` - EventDispose
//! - `[200, body_tag]` - Initialize
//! - `[201, id, body_tag]` - PromiseSuccess
//! - `[202, id, body_tag]` - PromiseError (body is `{message, name, stack}`)
//! - `[203, id, body_tag]` - PromiseErrorObj
//! - `[204, id, body_tag]` - EventFire

use bytes::Bytes;
use serde_json::Value;

use super::wire_format::{
    encode_frame, split_frame, ProtocolLimits, REQ_EVENT_DISPOSE, REQ_EVENT_LISTEN, REQ_PROMISE,
    REQ_PROMISE_CANCEL, RES_EVENT_FIRE, RES_INITIALIZE, RES_PROMISE_ERROR, RES_PROMISE_ERROR_OBJ,
    RES_PROMISE_SUCCESS,
};
use crate::codec::Body;
use crate::error::{ErrorBody, RemoteError, WiremuxError};

/// A request frame, sent client -> server within one peer pair.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    /// Call a command on a channel.
    Promise {
        id: u32,
        channel: String,
        name: String,
        arg: Body,
    },
    /// Cancel a prior `Promise` by id.
    PromiseCancel { id: u32 },
    /// Subscribe to an event on a channel.
    EventListen {
        id: u32,
        channel: String,
        name: String,
        arg: Body,
    },
    /// End a subscription by id.
    EventDispose { id: u32 },
}

impl RequestMessage {
    /// The request id this message refers to.
    pub fn id(&self) -> u32 {
        match self {
            RequestMessage::Promise { id, .. }
            | RequestMessage::PromiseCancel { id }
            | RequestMessage::EventListen { id, .. }
            | RequestMessage::EventDispose { id } => *id,
        }
    }

    /// Encode this message as a complete frame.
    pub fn encode(&self) -> Bytes {
        match self {
            RequestMessage::Promise {
                id,
                channel,
                name,
                arg,
            } => encode_frame(
                vec![
                    Value::from(REQ_PROMISE),
                    Value::from(*id),
                    Value::from(channel.as_str()),
                    Value::from(name.as_str()),
                ],
                arg,
            ),
            RequestMessage::PromiseCancel { id } => encode_frame(
                vec![Value::from(REQ_PROMISE_CANCEL), Value::from(*id)],
                &Body::Undefined,
            ),
            RequestMessage::EventListen {
                id,
                channel,
                name,
                arg,
            } => encode_frame(
                vec![
                    Value::from(REQ_EVENT_LISTEN),
                    Value::from(*id),
                    Value::from(channel.as_str()),
                    Value::from(name.as_str()),
                ],
                arg,
            ),
            RequestMessage::EventDispose { id } => encode_frame(
                vec![Value::from(REQ_EVENT_DISPOSE), Value::from(*id)],
                &Body::Undefined,
            ),
        }
    }
}

/// A response frame, sent server -> client within one peer pair.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    /// Handshake; the first frame a server engine sends.
    Initialize,
    /// Command completed.
    PromiseSuccess { id: u32, data: Body },
    /// Command failed with a structured error.
    PromiseError { id: u32, error: RemoteError },
    /// Command rejected with an arbitrary value.
    PromiseErrorObj { id: u32, data: Body },
    /// One event delivery for a subscription.
    EventFire { id: u32, data: Body },
}

impl ResponseMessage {
    /// Encode this message as a complete frame.
    pub fn encode(&self) -> Bytes {
        match self {
            ResponseMessage::Initialize => {
                encode_frame(vec![Value::from(RES_INITIALIZE)], &Body::Undefined)
            }
            ResponseMessage::PromiseSuccess { id, data } => encode_frame(
                vec![Value::from(RES_PROMISE_SUCCESS), Value::from(*id)],
                data,
            ),
            ResponseMessage::PromiseError { id, error } => {
                let body = serde_json::to_value(ErrorBody::from(error))
                    .expect("JSON serialization should not fail");
                encode_frame(
                    vec![Value::from(RES_PROMISE_ERROR), Value::from(*id)],
                    &Body::Value(body),
                )
            }
            ResponseMessage::PromiseErrorObj { id, data } => encode_frame(
                vec![Value::from(RES_PROMISE_ERROR_OBJ), Value::from(*id)],
                data,
            ),
            ResponseMessage::EventFire { id, data } => {
                encode_frame(vec![Value::from(RES_EVENT_FIRE), Value::from(*id)], data)
            }
        }
    }
}

/// An inbound frame after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request(RequestMessage),
    Response(ResponseMessage),
    /// A frame-type tag this engine does not know. Receivers drop it.
    Unknown(u64),
}

/// Decode one frame with default limits.
pub fn decode_frame(frame: &Bytes) -> Result<Incoming, WiremuxError> {
    decode_frame_with_limits(frame, &ProtocolLimits::default())
}

/// Decode one frame.
pub fn decode_frame_with_limits(
    frame: &Bytes,
    limits: &ProtocolLimits,
) -> Result<Incoming, WiremuxError> {
    let (elements, body_tag, body_bytes) = split_frame(frame, limits)?;

    let kind = elements[0]
        .as_u64()
        .ok_or_else(|| WiremuxError::MalformedFrame("frame-type tag is not an integer".into()))?;

    let message = match kind {
        REQ_PROMISE => {
            expect_len(&elements, 4)?;
            Incoming::Request(RequestMessage::Promise {
                id: elem_id(&elements, 1)?,
                channel: elem_str(&elements, 2)?,
                name: elem_str(&elements, 3)?,
                arg: Body::from_wire(body_tag, body_bytes)?,
            })
        }
        REQ_PROMISE_CANCEL => {
            expect_len(&elements, 2)?;
            Incoming::Request(RequestMessage::PromiseCancel {
                id: elem_id(&elements, 1)?,
            })
        }
        REQ_EVENT_LISTEN => {
            expect_len(&elements, 4)?;
            Incoming::Request(RequestMessage::EventListen {
                id: elem_id(&elements, 1)?,
                channel: elem_str(&elements, 2)?,
                name: elem_str(&elements, 3)?,
                arg: Body::from_wire(body_tag, body_bytes)?,
            })
        }
        REQ_EVENT_DISPOSE => {
            expect_len(&elements, 2)?;
            Incoming::Request(RequestMessage::EventDispose {
                id: elem_id(&elements, 1)?,
            })
        }
        RES_INITIALIZE => {
            expect_len(&elements, 1)?;
            Incoming::Response(ResponseMessage::Initialize)
        }
        RES_PROMISE_SUCCESS => {
            expect_len(&elements, 2)?;
            Incoming::Response(ResponseMessage::PromiseSuccess {
                id: elem_id(&elements, 1)?,
                data: Body::from_wire(body_tag, body_bytes)?,
            })
        }
        RES_PROMISE_ERROR => {
            expect_len(&elements, 2)?;
            let body = Body::from_wire(body_tag, body_bytes)?;
            let error_body: ErrorBody = match body {
                Body::Value(value) => serde_json::from_value(value).map_err(|err| {
                    WiremuxError::MalformedFrame(format!("invalid error body: {err}"))
                })?,
                _ => {
                    return Err(WiremuxError::MalformedFrame(
                        "error body is not structured".into(),
                    ))
                }
            };
            Incoming::Response(ResponseMessage::PromiseError {
                id: elem_id(&elements, 1)?,
                error: RemoteError::from(error_body),
            })
        }
        RES_PROMISE_ERROR_OBJ => {
            expect_len(&elements, 2)?;
            Incoming::Response(ResponseMessage::PromiseErrorObj {
                id: elem_id(&elements, 1)?,
                data: Body::from_wire(body_tag, body_bytes)?,
            })
        }
        RES_EVENT_FIRE => {
            expect_len(&elements, 2)?;
            Incoming::Response(ResponseMessage::EventFire {
                id: elem_id(&elements, 1)?,
                data: Body::from_wire(body_tag, body_bytes)?,
            })
        }
        other => Incoming::Unknown(other),
    };

    Ok(message)
}

fn expect_len(elements: &[Value], expected: usize) -> Result<(), WiremuxError> {
    if elements.len() != expected {
        return Err(WiremuxError::MalformedFrame(format!(
            "header has {} elements, expected {}",
            elements.len(),
            expected
        )));
    }
    Ok(())
}

fn elem_id(elements: &[Value], index: usize) -> Result<u32, WiremuxError> {
    elements
        .get(index)
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| WiremuxError::MalformedFrame(format!("element {index} is not a valid id")))
}

fn elem_str(elements: &[Value], index: usize) -> Result<String, WiremuxError> {
    elements
        .get(index)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| WiremuxError::MalformedFrame(format!("element {index} is not a string")))
}
