//! Error types for wiremux.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Body;
use crate::transport::TransportError;

/// Error name used when a channel or command is not registered.
pub(crate) const NOT_IMPLEMENTED_NAME: &str = "NotImplemented";

/// Main error type surfaced to callers of the client engine.
#[derive(Debug, Error)]
pub enum WiremuxError {
    /// The peer does not implement the requested channel or command.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The peer rejected the command with a structured error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The peer rejected the command with an arbitrary value, delivered verbatim.
    #[error("remote rejected with a non-error value")]
    RemoteValue(Body),

    /// The call was cancelled before a terminal response arrived.
    #[error("call was cancelled")]
    Cancelled,

    /// The engine was disposed, either explicitly or by transport disconnect.
    #[error("engine was disposed")]
    Disposed,

    /// An inbound frame could not be decoded. Never surfaced to pending
    /// callers; the engine drops the frame and continues.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type alias using WiremuxError.
pub type Result<T> = std::result::Result<T, WiremuxError>;

/// A structured failure received from the peer, materialized locally.
///
/// Carries the remote `message`, `name`, and `stack` exactly as transmitted.
/// The stack travels as a list of lines on the wire; [`RemoteError::stack_text`]
/// joins them back into a single block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    /// Error class name (e.g. `"TypeError"`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace lines; empty when the peer sent none.
    pub stack: Vec<String>,
}

impl RemoteError {
    /// Create a structured error with an empty stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// The rejection synthesized for unknown channels and commands.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(NOT_IMPLEMENTED_NAME, message)
    }

    /// Whether this is the not-implemented rejection.
    pub fn is_not_implemented(&self) -> bool {
        self.name == NOT_IMPLEMENTED_NAME
    }

    /// The stack joined with newlines.
    pub fn stack_text(&self) -> String {
        self.stack.join("\n")
    }
}

/// Error surface of a [`Channel`](crate::channel::Channel) command handler.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The handler failed with a structured error.
    #[error(transparent)]
    Failed(#[from] RemoteError),

    /// The handler rejected with an arbitrary value, delivered verbatim.
    #[error("command rejected with a non-error value")]
    Rejected(Body),

    /// The call was cancelled.
    #[error("call was cancelled")]
    Cancelled,

    /// The engine backing the channel was disposed.
    #[error("engine was disposed")]
    Disposed,
}

impl CallError {
    /// Shorthand for a not-implemented failure.
    pub fn not_implemented(message: impl Into<String>) -> Self {
        CallError::Failed(RemoteError::not_implemented(message))
    }
}

impl From<WiremuxError> for CallError {
    fn from(err: WiremuxError) -> Self {
        match err {
            WiremuxError::NotImplemented(message) => {
                CallError::Failed(RemoteError::not_implemented(message))
            }
            WiremuxError::Remote(error) => CallError::Failed(error),
            WiremuxError::RemoteValue(body) => CallError::Rejected(body),
            WiremuxError::Cancelled => CallError::Cancelled,
            WiremuxError::Disposed => CallError::Disposed,
            other => CallError::Failed(RemoteError::new("Error", other.to_string())),
        }
    }
}

/// Wire shape of a `PromiseError` body: `{message, name, stack}`.
///
/// The stack is accepted as either a single string or a list of lines;
/// encoding always produces the list form.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ErrorBody {
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<ErrorStack>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ErrorStack {
    Lines(Vec<String>),
    Text(String),
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        let stack = match body.stack {
            None => Vec::new(),
            Some(ErrorStack::Lines(lines)) => lines,
            Some(ErrorStack::Text(text)) => text.lines().map(str::to_owned).collect(),
        };
        Self {
            name: body.name,
            message: body.message,
            stack,
        }
    }
}

impl From<&RemoteError> for ErrorBody {
    fn from(error: &RemoteError) -> Self {
        Self {
            message: error.message.clone(),
            name: error.name.clone(),
            stack: if error.stack.is_empty() {
                None
            } else {
                Some(ErrorStack::Lines(error.stack.clone()))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::new("TypeError", "nice error");
        assert_eq!(err.to_string(), "TypeError: nice error");
    }

    #[test]
    fn test_not_implemented_marker() {
        let err = RemoteError::not_implemented("channel 'x' is not registered");
        assert!(err.is_not_implemented());
        assert!(!RemoteError::new("Error", "boom").is_not_implemented());
    }

    #[test]
    fn test_stack_decoded_from_text() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"message":"m","name":"Error","stack":"a\nb\nc"}"#).unwrap();
        let err = RemoteError::from(body);
        assert_eq!(err.stack, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_stack_decoded_from_lines() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"message":"m","name":"Error","stack":["a","b"]}"#).unwrap();
        let err = RemoteError::from(body);
        assert_eq!(err.stack, vec!["a", "b"]);
        assert_eq!(err.stack_text(), "a\nb");
    }

    #[test]
    fn test_stack_encoded_as_lines() {
        let mut err = RemoteError::new("Error", "m");
        err.stack = vec!["one".to_owned(), "two".to_owned()];
        let json = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert_eq!(json["stack"], serde_json::json!(["one", "two"]));
    }

    #[test]
    fn test_empty_stack_omitted() {
        let err = RemoteError::new("Error", "m");
        let json = serde_json::to_value(ErrorBody::from(&err)).unwrap();
        assert!(json.get("stack").is_none());
    }

    #[test]
    fn test_missing_name_defaults_empty() {
        let body: ErrorBody = serde_json::from_str(r#"{"message":"m"}"#).unwrap();
        let err = RemoteError::from(body);
        assert_eq!(err.name, "");
        assert!(err.stack.is_empty());
    }

    #[test]
    fn test_call_error_from_wiremux_error() {
        assert!(matches!(
            CallError::from(WiremuxError::Cancelled),
            CallError::Cancelled
        ));
        assert!(matches!(
            CallError::from(WiremuxError::NotImplemented("x".into())),
            CallError::Failed(e) if e.is_not_implemented()
        ));
    }
}
