//! Codec module - frame body classification and materialization.
//!
//! Every frame body is one of four classes, identified by the body-type tag
//! carried as the last element of the frame header:
//!
//! - [`Body::Undefined`] - no body (tag 0)
//! - [`Body::Text`] - UTF-8 text (tag 1)
//! - [`Body::Bytes`] - opaque bytes, passed through untouched (tag 2)
//! - [`Body::Value`] - a JSON value (tag 3)

mod body;

pub use body::Body;
