//! Transport module - the contract the engines consume.
//!
//! The engines require exactly two capabilities from a transport: send one
//! opaque message frame, and observe inbound frames in delivery order. How
//! frames move between processes (sockets, pipes, stdio tunnels) is the
//! transport implementation's concern; the engines impose no encoding on it
//! beyond treating each delivered message as one frame.

mod mem;

use bytes::Bytes;
use thiserror::Error;

use crate::BoxFuture;

pub use mem::MemTransport;

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed; no further frames can be sent or received.
    #[error("transport closed")]
    Closed,
}

/// One end of a reliable, message-oriented, in-order frame transport.
///
/// Send failures are tolerated by the engines: they are logged and swallowed,
/// and surface to callers only through the disconnect path (`recv` returning
/// `None`), which disposes the engines.
pub trait MessageTransport: Send + Sync + 'static {
    /// Queue one frame for delivery to the peer. Best-effort.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// The next inbound frame, in delivery order. Resolves to `None` once
    /// the transport disconnects.
    ///
    /// Only one component may drive `recv` at a time; the engines' frame
    /// loops are the sole consumers.
    fn recv(&self) -> BoxFuture<'_, Option<Bytes>>;
}
