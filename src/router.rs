//! Multi-client server with pluggable routing.
//!
//! A [`MuxServer`] accepts many peer connections. Each connection starts
//! with a handshake: the first inbound frame's raw bytes are the peer id.
//! The server then hosts a client/server engine pair per connection,
//! offering its registered channels to every peer. [`MuxServer::get_channel`]
//! returns a façade that resolves each call or subscription to a specific
//! connected peer via a caller-supplied [`Router`], waiting for the peer to
//! connect when necessary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::DelayedChannel;
use crate::channel::{Channel, EventStream};
use crate::client::ChannelClient;
use crate::codec::Body;
use crate::error::{CallError, WiremuxError};
use crate::protocol::{decode_frame, Incoming};
use crate::server::ChannelServer;
use crate::transport::{MessageTransport, TransportError};
use crate::BoxFuture;

/// Selects the target peer for an outgoing call or subscription.
pub trait Router: Send + Sync + 'static {
    /// Peer id that should receive this command.
    fn route_call(&self, command: &str, arg: &Body) -> String;

    /// Peer id that should receive this subscription.
    fn route_event(&self, event: &str, arg: &Body) -> String;
}

/// A server hosting one engine pair per connected peer.
#[derive(Clone)]
pub struct MuxServer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    /// Channels offered to every peer, applied to new connections at accept
    /// time and to live connections immediately on registration.
    channels: Mutex<HashMap<String, Arc<dyn Channel>>>,
    connections: Mutex<HashMap<String, Connection>>,
    client_added: broadcast::Sender<String>,
    connection_seq: AtomicU64,
    disposed: AtomicBool,
}

struct Connection {
    serial: u64,
    client: ChannelClient,
    server: ChannelServer,
    shutdown: CancellationToken,
}

impl Connection {
    fn dispose(&self) {
        self.shutdown.cancel();
        self.client.dispose();
        self.server.dispose();
    }
}

impl Default for MuxServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxServer {
    /// Create an empty server.
    pub fn new() -> Self {
        let (client_added, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(MuxInner {
                channels: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                client_added,
                connection_seq: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Offer a channel to all peers: future connections pick it up at
    /// accept time, existing connections immediately.
    pub fn register_channel(&self, name: &str, channel: Arc<dyn Channel>) {
        self.inner
            .channels
            .lock()
            .expect("lock poisoned")
            .insert(name.to_owned(), channel.clone());
        for connection in self
            .inner
            .connections
            .lock()
            .expect("lock poisoned")
            .values()
        {
            connection.server.register_channel(name, channel.clone());
        }
    }

    /// Serve one freshly connected transport.
    ///
    /// Consumes exactly one frame as the peer id, brings up the engine pair,
    /// and pumps frames until the transport disconnects or the server is
    /// disposed. The returned task resolves when the connection ends.
    pub fn accept(
        &self,
        transport: Arc<dyn MessageTransport>,
    ) -> JoinHandle<Result<(), WiremuxError>> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if inner.disposed.load(Ordering::Acquire) {
                return Err(WiremuxError::Disposed);
            }

            let Some(first) = transport.recv().await else {
                return Err(WiremuxError::Transport(TransportError::Closed));
            };
            let id = String::from_utf8(first.to_vec())
                .map_err(|_| WiremuxError::MalformedFrame("peer id is not UTF-8".into()))?;

            let server = ChannelServer::new(transport.clone());
            let channels: Vec<_> = inner
                .channels
                .lock()
                .expect("lock poisoned")
                .iter()
                .map(|(name, channel)| (name.clone(), channel.clone()))
                .collect();
            for (name, channel) in channels {
                server.register_channel(&name, channel);
            }

            let client = ChannelClient::new(transport.clone());
            let shutdown = CancellationToken::new();
            let serial = inner.connection_seq.fetch_add(1, Ordering::Relaxed);
            let connection = Connection {
                serial,
                client: client.clone(),
                server: server.clone(),
                shutdown: shutdown.clone(),
            };

            if let Some(previous) = inner
                .connections
                .lock()
                .expect("lock poisoned")
                .insert(id.clone(), connection)
            {
                tracing::warn!(peer = %id, "replacing existing connection with same id");
                previous.dispose();
            }
            let _ = inner.client_added.send(id.clone());
            tracing::debug!(peer = %id, "client connected");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = transport.recv() => match frame {
                        Some(raw) => match decode_frame(&raw) {
                            Ok(Incoming::Request(request)) => server.handle_request(request),
                            Ok(Incoming::Response(response)) => client.handle_response(response),
                            Ok(Incoming::Unknown(kind)) => {
                                tracing::debug!(kind, "dropping frame with unknown type tag");
                            }
                            Err(err) => tracing::warn!(%err, "dropping malformed frame"),
                        },
                        None => break,
                    }
                }
            }

            client.dispose();
            server.dispose();
            let mut connections = inner.connections.lock().expect("lock poisoned");
            if connections.get(&id).is_some_and(|c| c.serial == serial) {
                connections.remove(&id);
            }
            drop(connections);
            tracing::debug!(peer = %id, "client disconnected");
            Ok(())
        })
    }

    /// The client engine for a connected peer, if any.
    pub fn client(&self, peer: &str) -> Option<ChannelClient> {
        self.inner
            .connections
            .lock()
            .expect("lock poisoned")
            .get(peer)
            .map(|connection| connection.client.clone())
    }

    /// Ids of all connected peers.
    pub fn connected_peers(&self) -> Vec<String> {
        self.inner
            .connections
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// A channel façade that routes every call and subscription to the peer
    /// picked by `router`, waiting for that peer to connect if needed.
    pub fn get_channel(&self, name: &str, router: Arc<dyn Router>) -> Arc<dyn Channel> {
        Arc::new(RoutedChannel {
            inner: self.inner.clone(),
            name: name.to_owned(),
            router,
        })
    }

    /// Dispose every connection and refuse further accepts.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections =
            std::mem::take(&mut *self.inner.connections.lock().expect("lock poisoned"));
        for (_, connection) in connections {
            connection.dispose();
        }
    }
}

/// Resolve a peer's client engine, waiting for the peer to connect.
async fn wait_for_client(inner: &Arc<MuxInner>, peer: &str) -> Result<ChannelClient, CallError> {
    let mut added = inner.client_added.subscribe();
    loop {
        if inner.disposed.load(Ordering::Acquire) {
            return Err(CallError::Disposed);
        }
        if let Some(connection) = inner.connections.lock().expect("lock poisoned").get(peer) {
            return Ok(connection.client.clone());
        }
        match added.recv().await {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return Err(CallError::Disposed),
        }
    }
}

/// The façade returned by [`MuxServer::get_channel`].
struct RoutedChannel {
    inner: Arc<MuxInner>,
    name: String,
    router: Arc<dyn Router>,
}

impl RoutedChannel {
    /// A delayed channel that resolves to the named channel on `peer` once
    /// that peer is connected.
    fn channel_on(&self, peer: String) -> DelayedChannel {
        let inner = self.inner.clone();
        let name = self.name.clone();
        DelayedChannel::new(async move {
            let client = wait_for_client(&inner, &peer).await?;
            Ok(Arc::new(client.channel(&name)) as Arc<dyn Channel>)
        })
    }
}

impl Channel for RoutedChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>> {
        let peer = self.router.route_call(command, &arg);
        self.channel_on(peer).call(command, arg, token)
    }

    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError> {
        let peer = self.router.route_event(event, &arg);
        self.channel_on(peer).listen(event, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ChannelRegistry;
    use crate::peer::ChannelPeer;
    use crate::transport::MemTransport;

    struct FixedRouter(&'static str);

    impl Router for FixedRouter {
        fn route_call(&self, _command: &str, _arg: &Body) -> String {
            self.0.to_owned()
        }

        fn route_event(&self, _event: &str, _arg: &Body) -> String {
            self.0.to_owned()
        }
    }

    fn named_echo(answer: &'static str) -> Arc<dyn Channel> {
        Arc::new(
            ChannelRegistry::new()
                .on_call_raw("who", move |_arg, _token| async move {
                    Ok(Body::from(answer))
                }),
        )
    }

    async fn connect_peer(
        server: &MuxServer,
        id: &'static str,
        answer: &'static str,
    ) -> (ChannelPeer, Arc<MemTransport>) {
        let (client_end, server_end) = MemTransport::pair();
        let _serve = server.accept(server_end.clone());
        let peer = ChannelPeer::connect(client_end, id);
        peer.register_channel("ping", named_echo(answer));

        // Let the handshake settle.
        while !server.connected_peers().contains(&id.to_owned()) {
            tokio::task::yield_now().await;
        }
        (peer, server_end)
    }

    #[tokio::test]
    async fn test_routed_call_reaches_selected_peer() {
        let server = MuxServer::new();
        let (_alpha, _t1) = connect_peer(&server, "alpha", "alpha answers").await;
        let (_beta, _t2) = connect_peer(&server, "beta", "beta answers").await;

        let channel = server.get_channel("ping", Arc::new(FixedRouter("beta")));
        let result = channel
            .call("who", Body::Undefined, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, Body::from("beta answers"));
    }

    #[tokio::test]
    async fn test_routed_call_waits_for_peer_to_connect() {
        let server = MuxServer::new();
        let channel = server.get_channel("ping", Arc::new(FixedRouter("late")));

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call("who", Body::Undefined, CancellationToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (_late, _t) = connect_peer(&server, "late", "finally").await;
        assert_eq!(call.await.unwrap().unwrap(), Body::from("finally"));
    }

    #[tokio::test]
    async fn test_disconnecting_one_peer_leaves_others_untouched() {
        let server = MuxServer::new();
        let (alpha, alpha_end) = connect_peer(&server, "alpha", "alpha answers").await;
        let (_beta, _t2) = connect_peer(&server, "beta", "beta answers").await;

        // Kill alpha's transport in both directions.
        alpha_end.close();
        drop(alpha);
        while server.connected_peers().contains(&"alpha".to_owned()) {
            tokio::task::yield_now().await;
        }

        let channel = server.get_channel("ping", Arc::new(FixedRouter("beta")));
        let result = channel
            .call("who", Body::Undefined, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, Body::from("beta answers"));
    }

    #[tokio::test]
    async fn test_server_channels_offered_to_peers() {
        let server = MuxServer::new();
        server.register_channel("shared", named_echo("server answers"));

        let (peer, _t) = connect_peer(&server, "alpha", "ignored").await;
        let result = peer
            .channel("shared")
            .call("who", Body::Undefined)
            .await
            .unwrap();
        assert_eq!(result, Body::from("server answers"));
    }

    #[tokio::test]
    async fn test_late_registration_updates_live_connections() {
        let server = MuxServer::new();
        let (peer, _t) = connect_peer(&server, "alpha", "ignored").await;

        server.register_channel("added-later", named_echo("late answer"));
        let result = peer
            .channel("added-later")
            .call("who", Body::Undefined)
            .await
            .unwrap();
        assert_eq!(result, Body::from("late answer"));
    }

    #[tokio::test]
    async fn test_dispose_rejects_new_accepts() {
        let server = MuxServer::new();
        server.dispose();

        let (_client_end, server_end) = MemTransport::pair();
        let task = server.accept(server_end);
        assert!(matches!(task.await.unwrap(), Err(WiremuxError::Disposed)));
    }
}
