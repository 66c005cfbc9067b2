//! The channel capability: named commands and events, addressable remotely.
//!
//! A channel is a small capability with two operations: `call` resolves one
//! command to a single value or error, `listen` opens a stream of event
//! values. The variance lives entirely in the [`Body`] value type; no tagged
//! command variants are needed.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::Body;
use crate::error::CallError;
use crate::BoxFuture;

/// A named collection of commands and events.
///
/// Implementations must honor the [`CancellationToken`] handed to `call`:
/// the server engine fires it when the requester cancels, and long-running
/// handlers should observe it cooperatively.
pub trait Channel: Send + Sync + 'static {
    /// Invoke a command. Resolves to a single value or error.
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>>;

    /// Subscribe to an event. Yields a stream of values.
    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError>;
}

/// A stream of event values from one subscription.
///
/// Dropping the stream tears the subscription down: client-side streams send
/// `EventDispose` to the peer through a dispose hook. The hook owns only a
/// callback into the engine, so no reference cycle forms between the stream
/// and the engine's handler map.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Body>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl EventStream {
    /// Wrap a plain receiver with no dispose hook.
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<Body>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Create a sender/stream pair with no dispose hook.
    pub fn channel() -> (mpsc::UnboundedSender<Body>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::from_receiver(rx))
    }

    /// Wrap a receiver with a hook to run once when the stream is dropped
    /// or disposed.
    pub(crate) fn with_dispose(
        rx: mpsc::UnboundedReceiver<Body>,
        hook: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(hook)),
        }
    }

    /// The next event value, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Body> {
        self.rx.recv().await
    }

    /// Receive without waiting; `None` when no value is ready.
    pub fn try_recv(&mut self) -> Option<Body> {
        self.rx.try_recv().ok()
    }

    /// Tear the subscription down now instead of at drop time.
    pub fn dispose(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
        self.rx.close();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_dispose_hook", &self.on_drop.is_some())
            .finish()
    }
}
