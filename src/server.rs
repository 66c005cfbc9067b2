//! Channel-server engine.
//!
//! Accepts request frames, dispatches them to registered channels, streams
//! responses back, and holds a cancel handle per in-flight request. The
//! engine emits exactly one `Initialize` frame at construction, before any
//! response frame; that marker is what unblocks the peer's buffered
//! outbound queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::codec::Body;
use crate::error::{CallError, RemoteError};
use crate::protocol::{decode_frame, Incoming, RequestMessage, ResponseMessage};
use crate::transport::MessageTransport;

/// The channel-server engine: one per direction of one transport.
///
/// Cheaply cloneable; all clones share the same connection state.
#[derive(Clone)]
pub struct ChannelServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    transport: Arc<dyn MessageTransport>,
    channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
    /// Cancel handles for in-flight calls and live subscriptions, by request
    /// id. A terminal response may only be emitted by the task that removes
    /// the entry, so a cancel that removes it first suppresses the response.
    active: Mutex<HashMap<u32, ActiveHandle>>,
    disposed: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

enum ActiveHandle {
    Call(CancellationToken),
    Subscription(CancellationToken),
}

impl ActiveHandle {
    fn cancel(&self) {
        match self {
            ActiveHandle::Call(token) | ActiveHandle::Subscription(token) => token.cancel(),
        }
    }
}

impl ChannelServer {
    /// Create a server engine bound to a transport and send the
    /// `Initialize` marker.
    ///
    /// The caller is responsible for feeding inbound request frames via
    /// [`ChannelServer::handle_request`]; use [`ChannelServer::attach`] for
    /// an engine that drives its own frame loop.
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        let server = Self {
            inner: Arc::new(ServerInner {
                transport,
                channels: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
                loop_task: Mutex::new(None),
            }),
        };
        server.inner.send_response(ResponseMessage::Initialize);
        server
    }

    /// Create a server engine that consumes the transport's inbound frames
    /// itself. Suitable for endpoints that only offer channels.
    pub fn attach(transport: Arc<dyn MessageTransport>) -> Self {
        let server = Self::new(transport.clone());
        let engine = server.clone();
        let task = tokio::spawn(async move {
            while let Some(raw) = transport.recv().await {
                match decode_frame(&raw) {
                    Ok(Incoming::Request(request)) => engine.handle_request(request),
                    Ok(Incoming::Response(_)) => {
                        tracing::debug!("server engine dropping response frame");
                    }
                    Ok(Incoming::Unknown(kind)) => {
                        tracing::debug!(kind, "dropping frame with unknown type tag");
                    }
                    Err(err) => tracing::warn!(%err, "dropping malformed frame"),
                }
            }
            tracing::debug!("transport closed, disposing server engine");
            engine.dispose();
        });
        *server.inner.loop_task.lock().expect("lock poisoned") = Some(task);
        server
    }

    /// Register a channel under a name. Safe against concurrent incoming
    /// frames; replaces any previous channel with the same name.
    pub fn register_channel(&self, name: &str, channel: Arc<dyn Channel>) {
        self.inner
            .channels
            .lock()
            .expect("lock poisoned")
            .insert(name.to_owned(), channel);
    }

    /// Feed one inbound request frame into the engine.
    pub fn handle_request(&self, request: RequestMessage) {
        if self.inner.disposed.load(Ordering::Acquire) {
            return;
        }
        match request {
            RequestMessage::Promise {
                id,
                channel,
                name,
                arg,
            } => self.inner.clone().handle_promise(id, channel, name, arg),
            RequestMessage::EventListen {
                id,
                channel,
                name,
                arg,
            } => self
                .inner
                .clone()
                .handle_event_listen(id, channel, name, arg),
            RequestMessage::PromiseCancel { id } | RequestMessage::EventDispose { id } => {
                self.inner.handle_cancel(id);
            }
        }
    }

    /// Dispose the engine: fire every outstanding cancel handle and drop the
    /// active map. No terminal responses are emitted afterwards.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl ServerInner {
    fn send_response(&self, response: ResponseMessage) {
        self.send_frame(response.encode());
    }

    fn send_frame(&self, frame: Bytes) {
        if let Err(err) = self.transport.send(frame) {
            tracing::warn!(%err, "frame send failed");
        }
    }

    fn lookup(&self, channel: &str) -> Option<Arc<dyn Channel>> {
        self.channels
            .lock()
            .expect("lock poisoned")
            .get(channel)
            .cloned()
    }

    fn handle_promise(self: Arc<Self>, id: u32, channel: String, name: String, arg: Body) {
        let Some(chan) = self.lookup(&channel) else {
            self.send_response(ResponseMessage::PromiseError {
                id,
                error: RemoteError::not_implemented(format!(
                    "channel '{channel}' is not registered"
                )),
            });
            return;
        };

        let token = CancellationToken::new();
        self.active
            .lock()
            .expect("lock poisoned")
            .insert(id, ActiveHandle::Call(token.clone()));

        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = chan.call(&name, arg, token.clone()) => outcome,
                // The cancel path already removed the active entry; dropping
                // the call future here aborts the handler cooperatively.
                _ = token.cancelled() => return,
            };

            if inner
                .active
                .lock()
                .expect("lock poisoned")
                .remove(&id)
                .is_none()
            {
                // Cancelled between completion and response emission.
                return;
            }

            let response = match outcome {
                Ok(data) => ResponseMessage::PromiseSuccess { id, data },
                Err(CallError::Failed(error)) => ResponseMessage::PromiseError { id, error },
                Err(CallError::Rejected(data)) => ResponseMessage::PromiseErrorObj { id, data },
                Err(CallError::Cancelled) => ResponseMessage::PromiseError {
                    id,
                    error: RemoteError::new("Canceled", "the operation was cancelled"),
                },
                Err(CallError::Disposed) => ResponseMessage::PromiseError {
                    id,
                    error: RemoteError::new("Disposed", "the target engine was disposed"),
                },
            };
            inner.send_response(response);
        });
    }

    fn handle_event_listen(self: Arc<Self>, id: u32, channel: String, name: String, arg: Body) {
        let Some(chan) = self.lookup(&channel) else {
            tracing::warn!(%channel, event = %name, "listen on unknown channel");
            return;
        };

        let mut stream = match chan.listen(&name, arg) {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%err, %channel, event = %name, "listen rejected");
                return;
            }
        };

        let token = CancellationToken::new();
        self.active
            .lock()
            .expect("lock poisoned")
            .insert(id, ActiveHandle::Subscription(token.clone()));

        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    value = stream.recv() => match value {
                        Some(data) => {
                            // A dispose may have raced the receive.
                            if token.is_cancelled() {
                                break;
                            }
                            inner.send_response(ResponseMessage::EventFire { id, data });
                        }
                        None => {
                            // The source ended on its own; forget the handle
                            // so a later dispose is a no-op.
                            inner.active.lock().expect("lock poisoned").remove(&id);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// `PromiseCancel` and `EventDispose` share one idempotent path.
    fn handle_cancel(&self, id: u32) {
        match self.active.lock().expect("lock poisoned").remove(&id) {
            Some(handle) => handle.cancel(),
            None => tracing::trace!(id, "cancel for unknown id"),
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let active = std::mem::take(&mut *self.active.lock().expect("lock poisoned"));
        for (_, handle) in active {
            handle.cancel();
        }
        if let Some(task) = self.loop_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }
}
