//! Channel-client engine.
//!
//! Issues requests, correlates responses by id, manages subscriptions, and
//! buffers outbound traffic until the peer's `Initialize` marker arrives.
//!
//! The engine starts `Uninitialized`. Requests issued in that state are
//! encoded and queued immediately, so their ids and relative order are fixed
//! at issue time; observing `Initialize` flushes the queue in insertion
//! order. Cancelling a still-buffered request removes it from the queue and
//! nothing is ever sent for it.
//!
//! # Example
//!
//! ```ignore
//! use wiremux::{Body, ChannelClient};
//!
//! let client = ChannelClient::attach(transport);
//! let echo = client.channel("echo");
//! let reply = echo.call("marco", Body::from("hi")).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, EventStream};
use crate::codec::Body;
use crate::error::{CallError, WiremuxError, NOT_IMPLEMENTED_NAME};
use crate::protocol::{decode_frame, Incoming, RequestMessage, ResponseMessage};
use crate::transport::MessageTransport;
use crate::BoxFuture;

/// The channel-client engine: one per direction of one transport.
///
/// Cheaply cloneable; all clones share the same connection state.
#[derive(Clone)]
pub struct ChannelClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn MessageTransport>,
    state: Mutex<ClientState>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Idle,
    Disposed,
}

struct ClientState {
    phase: Phase,
    next_id: u32,
    /// Encoded request frames queued while `Uninitialized`, in issue order.
    buffered: Vec<BufferedRequest>,
    /// Per-id response handlers.
    handlers: HashMap<u32, ResponseHandler>,
}

struct BufferedRequest {
    id: u32,
    frame: Bytes,
}

enum ResponseHandler {
    Call(oneshot::Sender<Result<Body, WiremuxError>>),
    Event(mpsc::UnboundedSender<Body>),
}

impl ChannelClient {
    /// Create a client engine bound to a transport.
    ///
    /// The caller is responsible for feeding inbound response frames via
    /// [`ChannelClient::handle_response`]; use [`ChannelClient::attach`] for
    /// an engine that drives its own frame loop.
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                state: Mutex::new(ClientState {
                    phase: Phase::Uninitialized,
                    next_id: 0,
                    buffered: Vec::new(),
                    handlers: HashMap::new(),
                }),
                loop_task: Mutex::new(None),
            }),
        }
    }

    /// Create a client engine that consumes the transport's inbound frames
    /// itself. Suitable for endpoints that only consume channels.
    pub fn attach(transport: Arc<dyn MessageTransport>) -> Self {
        let client = Self::new(transport.clone());
        let engine = client.clone();
        let task = tokio::spawn(async move {
            while let Some(raw) = transport.recv().await {
                match decode_frame(&raw) {
                    Ok(Incoming::Response(response)) => engine.handle_response(response),
                    Ok(Incoming::Request(request)) => {
                        tracing::debug!(id = request.id(), "client engine dropping request frame");
                    }
                    Ok(Incoming::Unknown(kind)) => {
                        tracing::debug!(kind, "dropping frame with unknown type tag");
                    }
                    Err(err) => tracing::warn!(%err, "dropping malformed frame"),
                }
            }
            tracing::debug!("transport closed, disposing client engine");
            engine.dispose();
        });
        *client.inner.loop_task.lock().expect("lock poisoned") = Some(task);
        client
    }

    /// A handle to the named remote channel.
    pub fn channel(&self, name: &str) -> ClientChannel {
        ClientChannel {
            client: self.clone(),
            name: name.to_owned(),
        }
    }

    /// Issue a command call on a remote channel.
    ///
    /// The request is sent immediately when the engine is `Idle`, or queued
    /// until `Initialize` arrives. Cancelling (or dropping) the returned
    /// future sends `PromiseCancel` iff the request already left the queue;
    /// either way the future settles as cancelled.
    pub fn request(&self, channel: &str, command: &str, arg: Body) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock().expect("lock poisoned");

        let id = state.next_id;
        state.next_id += 1;

        if state.phase == Phase::Disposed {
            let _ = tx.send(Err(WiremuxError::Disposed));
            return PendingCall {
                inner: self.inner.clone(),
                id,
                rx,
                finished: false,
            };
        }

        let frame = RequestMessage::Promise {
            id,
            channel: channel.to_owned(),
            name: command.to_owned(),
            arg,
        }
        .encode();

        state.handlers.insert(id, ResponseHandler::Call(tx));
        match state.phase {
            Phase::Idle => self.inner.send_frame(&frame),
            Phase::Uninitialized => state.buffered.push(BufferedRequest { id, frame }),
            Phase::Disposed => unreachable!(),
        }

        PendingCall {
            inner: self.inner.clone(),
            id,
            rx,
            finished: false,
        }
    }

    /// Subscribe to an event on a remote channel.
    ///
    /// Dropping the returned stream sends `EventDispose` if the
    /// `EventListen` was ever sent; a subscription still sitting in the
    /// pre-initialization queue is removed silently.
    pub fn subscribe(&self, channel: &str, event: &str, arg: Body) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().expect("lock poisoned");

        if state.phase == Phase::Disposed {
            // The stream ends immediately; no hook, nothing on the wire.
            return EventStream::from_receiver(rx);
        }

        let id = state.next_id;
        state.next_id += 1;

        let frame = RequestMessage::EventListen {
            id,
            channel: channel.to_owned(),
            name: event.to_owned(),
            arg,
        }
        .encode();

        state.handlers.insert(id, ResponseHandler::Event(tx));
        match state.phase {
            Phase::Idle => self.inner.send_frame(&frame),
            Phase::Uninitialized => state.buffered.push(BufferedRequest { id, frame }),
            Phase::Disposed => unreachable!(),
        }
        drop(state);

        let inner = self.inner.clone();
        EventStream::with_dispose(rx, move || inner.dispose_subscription(id))
    }

    /// Feed one inbound response frame into the engine.
    pub fn handle_response(&self, response: ResponseMessage) {
        match response {
            ResponseMessage::Initialize => self.inner.handle_initialize(),
            ResponseMessage::PromiseSuccess { id, data } => self.inner.settle(id, Ok(data)),
            ResponseMessage::PromiseError { id, error } => {
                let err = if error.name == NOT_IMPLEMENTED_NAME {
                    WiremuxError::NotImplemented(error.message)
                } else {
                    WiremuxError::Remote(error)
                };
                self.inner.settle(id, Err(err));
            }
            ResponseMessage::PromiseErrorObj { id, data } => {
                self.inner.settle(id, Err(WiremuxError::RemoteValue(data)));
            }
            ResponseMessage::EventFire { id, data } => self.inner.fire_event(id, data),
        }
    }

    /// Whether `Initialize` has been observed.
    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().expect("lock poisoned").phase == Phase::Idle
    }

    /// Dispose the engine: reject all outstanding calls with
    /// [`WiremuxError::Disposed`], terminate all subscriptions, and drop the
    /// pre-initialization queue.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl ClientInner {
    fn send_frame(&self, frame: &Bytes) {
        if let Err(err) = self.transport.send(frame.clone()) {
            tracing::warn!(%err, "frame send failed");
        }
    }

    fn handle_initialize(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.phase != Phase::Uninitialized {
            tracing::debug!("ignoring redundant initialize");
            return;
        }
        state.phase = Phase::Idle;
        // Flushing under the lock keeps buffered frames ahead of any request
        // issued concurrently after the phase flip.
        let buffered = std::mem::take(&mut state.buffered);
        for request in buffered {
            self.send_frame(&request.frame);
        }
    }

    fn settle(&self, id: u32, outcome: Result<Body, WiremuxError>) {
        let mut state = self.state.lock().expect("lock poisoned");
        match state.handlers.get(&id) {
            Some(ResponseHandler::Call(_)) => {
                if let Some(ResponseHandler::Call(tx)) = state.handlers.remove(&id) {
                    let _ = tx.send(outcome);
                }
            }
            Some(ResponseHandler::Event(_)) => {
                tracing::warn!(id, "terminal response for a subscription id");
            }
            None => tracing::trace!(id, "response for unknown id"),
        }
    }

    fn fire_event(&self, id: u32, data: Body) {
        let state = self.state.lock().expect("lock poisoned");
        match state.handlers.get(&id) {
            Some(ResponseHandler::Event(tx)) => {
                let _ = tx.send(data);
            }
            Some(ResponseHandler::Call(_)) => {
                tracing::warn!(id, "event fire for a promise id");
            }
            None => tracing::trace!(id, "event fire for unknown id"),
        }
    }

    fn cancel_call(&self, id: u32) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.phase == Phase::Disposed {
            return;
        }
        let buffered = take_buffered(&mut state.buffered, id);
        if let Some(handler) = state.handlers.remove(&id) {
            if buffered.is_none() {
                self.send_frame(&RequestMessage::PromiseCancel { id }.encode());
            }
            if let ResponseHandler::Call(tx) = handler {
                let _ = tx.send(Err(WiremuxError::Cancelled));
            }
        }
    }

    fn dispose_subscription(&self, id: u32) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.phase == Phase::Disposed {
            return;
        }
        let buffered = take_buffered(&mut state.buffered, id);
        if state.handlers.remove(&id).is_some() && buffered.is_none() {
            self.send_frame(&RequestMessage::EventDispose { id }.encode());
        }
    }

    fn dispose(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.phase == Phase::Disposed {
            return;
        }
        state.phase = Phase::Disposed;
        state.buffered.clear();
        for (_, handler) in state.handlers.drain() {
            if let ResponseHandler::Call(tx) = handler {
                let _ = tx.send(Err(WiremuxError::Disposed));
            }
            // Dropping an event sender terminates its stream.
        }
        drop(state);

        if let Some(task) = self.loop_task.lock().expect("lock poisoned").take() {
            task.abort();
        }
    }
}

fn take_buffered(buffered: &mut Vec<BufferedRequest>, id: u32) -> Option<BufferedRequest> {
    let index = buffered.iter().position(|request| request.id == id)?;
    Some(buffered.remove(index))
}

/// A command call awaiting its terminal response.
///
/// Resolves to the response value, a remote failure, or
/// [`WiremuxError::Cancelled`] / [`WiremuxError::Disposed`]. Dropping it
/// before completion cancels the call.
pub struct PendingCall {
    inner: Arc<ClientInner>,
    id: u32,
    rx: oneshot::Receiver<Result<Body, WiremuxError>>,
    finished: bool,
}

impl PendingCall {
    /// The request id assigned to this call.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Cancel the call. Sends `PromiseCancel` if the request was already on
    /// the wire; a still-buffered request is removed silently. The future
    /// then settles as [`WiremuxError::Cancelled`].
    pub fn cancel(&mut self) {
        if !self.finished {
            self.inner.cancel_call(self.id);
        }
    }
}

impl Future for PendingCall {
    type Output = Result<Body, WiremuxError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.finished = true;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                self.finished = true;
                Poll::Ready(Err(WiremuxError::Cancelled))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.cancel_call(self.id);
        }
    }
}

/// A handle to one named channel on the remote peer.
#[derive(Clone)]
pub struct ClientChannel {
    client: ChannelClient,
    name: String,
}

impl ClientChannel {
    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call a command on this channel.
    pub fn call(&self, command: &str, arg: Body) -> PendingCall {
        self.client.request(&self.name, command, arg)
    }

    /// Subscribe to an event on this channel.
    pub fn listen(&self, event: &str, arg: Body) -> EventStream {
        self.client.subscribe(&self.name, event, arg)
    }
}

impl Channel for ClientChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>> {
        let mut pending = self.client.request(&self.name, command, arg);
        Box::pin(async move {
            tokio::select! {
                outcome = &mut pending => outcome.map_err(CallError::from),
                _ = token.cancelled() => {
                    pending.cancel();
                    Err(CallError::Cancelled)
                }
            }
        })
    }

    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError> {
        Ok(self.client.subscribe(&self.name, event, arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::transport::MemTransport;

    fn decoded(frame: Bytes) -> Incoming {
        decode_frame(&frame).unwrap()
    }

    async fn recv_request(transport: &MemTransport) -> RequestMessage {
        match decoded(transport.recv().await.expect("frame expected")) {
            Incoming::Request(request) => request,
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn send_response(transport: &MemTransport, response: ResponseMessage) {
        transport.send(response.encode()).unwrap();
    }

    fn initialized_client(transport: Arc<MemTransport>) -> ChannelClient {
        let client = ChannelClient::new(transport);
        client.handle_response(ResponseMessage::Initialize);
        client
    }

    #[tokio::test]
    async fn test_call_resolves_on_success() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let pending = client.request("echo", "marco", Body::from("hi"));
        let id = pending.id();

        let request = recv_request(&remote).await;
        assert_eq!(
            request,
            RequestMessage::Promise {
                id,
                channel: "echo".into(),
                name: "marco".into(),
                arg: Body::from("hi"),
            }
        );

        client.handle_response(ResponseMessage::PromiseSuccess {
            id,
            data: Body::from("polo"),
        });
        assert_eq!(pending.await.unwrap(), Body::from("polo"));
    }

    #[tokio::test]
    async fn test_requests_buffer_until_initialize() {
        let (local, remote) = MemTransport::pair();
        let client = ChannelClient::new(local.clone());

        let _first = client.request("a", "one", Body::Undefined);
        let _second = client.request("a", "two", Body::Undefined);

        // Nothing reaches the wire before the initialize marker. Closing the
        // sending half proves the queue held everything back.
        local.close();
        assert_eq!(remote.recv().await, None);
    }

    #[tokio::test]
    async fn test_buffered_flush_preserves_order() {
        let (local, remote) = MemTransport::pair();
        let client = ChannelClient::new(local);

        let calls: Vec<PendingCall> = (0..3)
            .map(|i| client.request("chan", &format!("cmd{i}"), Body::Undefined))
            .collect();

        client.handle_response(ResponseMessage::Initialize);

        for (i, call) in calls.iter().enumerate() {
            let request = recv_request(&remote).await;
            match request {
                RequestMessage::Promise { id, name, .. } => {
                    assert_eq!(id, call.id());
                    assert_eq!(name, format!("cmd{i}"));
                }
                other => panic!("expected promise, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_buffered_request_sends_nothing() {
        let (local, remote) = MemTransport::pair();
        let client = ChannelClient::new(local);

        let mut pending = client.request("chan", "cmd", Body::Undefined);
        pending.cancel();
        assert!(matches!(pending.await, Err(WiremuxError::Cancelled)));

        client.handle_response(ResponseMessage::Initialize);

        // Flush produced no frames; prove the wire stays silent by sending a
        // sentinel afterwards and seeing it first.
        let sentinel = client.request("chan", "sentinel", Body::Undefined);
        let request = recv_request(&remote).await;
        assert_eq!(request.id(), sentinel.id());
    }

    #[tokio::test]
    async fn test_cancel_sent_request_emits_promise_cancel() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let mut pending = client.request("chan", "slow", Body::Undefined);
        let id = pending.id();
        let _ = recv_request(&remote).await;

        pending.cancel();
        assert_eq!(
            recv_request(&remote).await,
            RequestMessage::PromiseCancel { id }
        );
        assert!(matches!(pending.await, Err(WiremuxError::Cancelled)));
    }

    #[tokio::test]
    async fn test_drop_cancels_pending_call() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let pending = client.request("chan", "slow", Body::Undefined);
        let id = pending.id();
        let _ = recv_request(&remote).await;
        drop(pending);

        assert_eq!(
            recv_request(&remote).await,
            RequestMessage::PromiseCancel { id }
        );
    }

    #[tokio::test]
    async fn test_late_response_after_cancel_is_dropped() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let mut pending = client.request("chan", "slow", Body::Undefined);
        let id = pending.id();
        let _ = recv_request(&remote).await;
        pending.cancel();

        // A late terminal response for a cancelled id is silently ignored.
        client.handle_response(ResponseMessage::PromiseSuccess {
            id,
            data: Body::from("late"),
        });
        assert!(matches!(pending.await, Err(WiremuxError::Cancelled)));
        drop(remote);
    }

    #[tokio::test]
    async fn test_id_allocation_is_monotonic() {
        let (local, _remote) = MemTransport::pair();
        let client = initialized_client(local);

        let a = client.request("c", "x", Body::Undefined);
        let b = client.request("c", "y", Body::Undefined);
        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn test_subscription_lifecycle() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let mut stream = client.subscribe("watch", "pong", Body::Undefined);
        let id = match recv_request(&remote).await {
            RequestMessage::EventListen { id, .. } => id,
            other => panic!("expected event listen, got {other:?}"),
        };

        client.handle_response(ResponseMessage::EventFire {
            id,
            data: Body::from("hello"),
        });
        client.handle_response(ResponseMessage::EventFire {
            id,
            data: Body::from("world"),
        });
        assert_eq!(stream.recv().await, Some(Body::from("hello")));
        assert_eq!(stream.recv().await, Some(Body::from("world")));

        drop(stream);
        assert_eq!(
            recv_request(&remote).await,
            RequestMessage::EventDispose { id }
        );

        // Fires after dispose never reach a local subscriber.
        client.handle_response(ResponseMessage::EventFire {
            id,
            data: Body::from("ghost"),
        });
    }

    #[tokio::test]
    async fn test_buffered_subscription_dropped_before_init_sends_nothing() {
        let (local, remote) = MemTransport::pair();
        let client = ChannelClient::new(local);

        let stream = client.subscribe("watch", "pong", Body::Undefined);
        drop(stream);

        client.handle_response(ResponseMessage::Initialize);

        let sentinel = client.request("chan", "sentinel", Body::Undefined);
        assert_eq!(recv_request(&remote).await.id(), sentinel.id());
    }

    #[tokio::test]
    async fn test_remote_error_materialized() {
        let (local, remote) = MemTransport::pair();
        let client = initialized_client(local);

        let pending = client.request("chan", "explode", Body::Undefined);
        let id = pending.id();
        let _ = recv_request(&remote).await;

        let mut error = RemoteError::new("Error", "nice error");
        error.stack = vec!["at boom".into()];
        client.handle_response(ResponseMessage::PromiseError { id, error });

        match pending.await {
            Err(WiremuxError::Remote(err)) => {
                assert_eq!(err.message, "nice error");
                assert_eq!(err.name, "Error");
                assert_eq!(err.stack_text(), "at boom");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_implemented_materialized() {
        let (local, _remote) = MemTransport::pair();
        let client = initialized_client(local);

        let pending = client.request("nope", "cmd", Body::Undefined);
        let id = pending.id();
        client.handle_response(ResponseMessage::PromiseError {
            id,
            error: RemoteError::not_implemented("channel 'nope' is not registered"),
        });
        assert!(matches!(pending.await, Err(WiremuxError::NotImplemented(_))));
    }

    #[tokio::test]
    async fn test_dispose_rejects_outstanding_and_future_calls() {
        let (local, _remote) = MemTransport::pair();
        let client = initialized_client(local);

        let outstanding = client.request("chan", "slow", Body::Undefined);
        client.dispose();
        assert!(matches!(outstanding.await, Err(WiremuxError::Disposed)));

        let after = client.request("chan", "more", Body::Undefined);
        assert!(matches!(after.await, Err(WiremuxError::Disposed)));
    }

    #[tokio::test]
    async fn test_dispose_terminates_subscriptions() {
        let (local, _remote) = MemTransport::pair();
        let client = initialized_client(local);

        let mut stream = client.subscribe("watch", "pong", Body::Undefined);
        client.dispose();
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_unknown_id_response_ignored() {
        let (local, _remote) = MemTransport::pair();
        let client = initialized_client(local);

        // Must not panic or disturb other state.
        client.handle_response(ResponseMessage::PromiseSuccess {
            id: 999,
            data: Body::Undefined,
        });
    }

    #[tokio::test]
    async fn test_attach_drives_frame_loop() {
        let (local, remote) = MemTransport::pair();
        let client = ChannelClient::attach(local);

        send_response(&remote, ResponseMessage::Initialize);
        let pending = client.request("echo", "marco", Body::Undefined);
        let id = pending.id();

        let _ = recv_request(&remote).await;
        send_response(
            &remote,
            ResponseMessage::PromiseSuccess {
                id,
                data: Body::from("polo"),
            },
        );
        assert_eq!(pending.await.unwrap(), Body::from("polo"));
    }
}
