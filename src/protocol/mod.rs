//! Protocol module - wire format and typed frame messages.
//!
//! Every frame is `u32 BE header_len` followed by `header_len` bytes of a
//! UTF-8 JSON array, followed by the remaining frame bytes as body. The
//! header array's first element is the frame-type tag, its last element the
//! body-type tag.

mod message;
mod wire_format;

pub use message::{
    decode_frame, decode_frame_with_limits, Incoming, RequestMessage, ResponseMessage,
};
pub use wire_format::{
    ProtocolLimits, DEFAULT_MAX_HEADER_LEN, HEADER_LEN_SIZE, REQ_EVENT_DISPOSE, REQ_EVENT_LISTEN,
    REQ_PROMISE, REQ_PROMISE_CANCEL, RES_EVENT_FIRE, RES_INITIALIZE, RES_PROMISE_ERROR,
    RES_PROMISE_ERROR_OBJ, RES_PROMISE_SUCCESS,
};
