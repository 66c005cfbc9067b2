//! Peer: one client engine and one server engine on a single transport.
//!
//! Both engines observe the same inbound stream; the frame-type tag decides
//! which engine handles each frame. A connecting peer writes an identity
//! frame - raw UTF-8 id bytes - before anything else, so a multi-client
//! server can register it for routing. Disposal runs client-before-server.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::channel::Channel;
use crate::client::{ChannelClient, ClientChannel};
use crate::protocol::{decode_frame, Incoming};
use crate::server::ChannelServer;
use crate::transport::MessageTransport;

/// One endpoint of a transport, able to both offer and consume channels.
pub struct ChannelPeer {
    client: ChannelClient,
    server: ChannelServer,
    loop_task: JoinHandle<()>,
}

impl ChannelPeer {
    /// Create a peer over a transport without an identity exchange, for
    /// symmetric pairs that are not routed by a multi-client server.
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        let server = ChannelServer::new(transport.clone());
        let client = ChannelClient::new(transport.clone());
        let loop_task = spawn_frame_loop(transport, client.clone(), server.clone());
        Self {
            client,
            server,
            loop_task,
        }
    }

    /// Connect to a multi-client server: write the identity frame carrying
    /// this peer's id, then bring up both engines.
    pub fn connect(transport: Arc<dyn MessageTransport>, id: &str) -> Self {
        // The identity frame precedes every protocol frame, including the
        // server engine's Initialize.
        if let Err(err) = transport.send(Bytes::copy_from_slice(id.as_bytes())) {
            tracing::warn!(%err, "identity frame send failed");
        }
        Self::new(transport)
    }

    /// The client engine.
    pub fn client(&self) -> &ChannelClient {
        &self.client
    }

    /// The server engine.
    pub fn server(&self) -> &ChannelServer {
        &self.server
    }

    /// A handle to the named channel offered by the remote side.
    pub fn channel(&self, name: &str) -> ClientChannel {
        self.client.channel(name)
    }

    /// Offer a channel to the remote side.
    pub fn register_channel(&self, name: &str, channel: Arc<dyn Channel>) {
        self.server.register_channel(name, channel);
    }

    /// Dispose both engines, client before server, and stop the frame loop.
    pub fn dispose(&self) {
        self.client.dispose();
        self.server.dispose();
        self.loop_task.abort();
    }
}

impl Drop for ChannelPeer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Drive one transport's inbound stream into a client/server engine pair.
/// On end-of-stream, disposes client before server.
pub(crate) fn spawn_frame_loop(
    transport: Arc<dyn MessageTransport>,
    client: ChannelClient,
    server: ChannelServer,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = transport.recv().await {
            match decode_frame(&raw) {
                Ok(Incoming::Request(request)) => server.handle_request(request),
                Ok(Incoming::Response(response)) => client.handle_response(response),
                Ok(Incoming::Unknown(kind)) => {
                    tracing::debug!(kind, "dropping frame with unknown type tag");
                }
                Err(err) => tracing::warn!(%err, "dropping malformed frame"),
            }
        }
        tracing::debug!("transport closed, disposing peer engines");
        client.dispose();
        server.dispose();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Body;
    use crate::error::WiremuxError;
    use crate::handler::ChannelRegistry;
    use crate::transport::MemTransport;

    fn echo_registry() -> Arc<dyn Channel> {
        Arc::new(
            ChannelRegistry::new()
                .on_call_raw("marco", |_arg, _token| async move { Ok(Body::from("polo")) }),
        )
    }

    #[tokio::test]
    async fn test_peers_call_each_other() {
        let (left, right) = MemTransport::pair();
        let alice = ChannelPeer::new(left);
        let bob = ChannelPeer::new(right);

        alice.register_channel("alice-echo", echo_registry());
        bob.register_channel("bob-echo", echo_registry());

        let from_alice = alice
            .channel("bob-echo")
            .call("marco", Body::Undefined)
            .await
            .unwrap();
        assert_eq!(from_alice, Body::from("polo"));

        let from_bob = bob
            .channel("alice-echo")
            .call("marco", Body::Undefined)
            .await
            .unwrap();
        assert_eq!(from_bob, Body::from("polo"));
    }

    #[tokio::test]
    async fn test_connect_writes_identity_first() {
        let (left, right) = MemTransport::pair();
        let _peer = ChannelPeer::connect(left, "alpha");

        let first = right.recv().await.unwrap();
        assert_eq!(&first[..], b"alpha");

        // The next frame is a regular protocol frame (the peer's Initialize).
        let second = right.recv().await.unwrap();
        assert!(decode_frame(&second).is_ok());
    }

    #[tokio::test]
    async fn test_transport_drop_fails_outstanding_calls() {
        let (left, right) = MemTransport::pair();
        let alice = ChannelPeer::new(left);
        let bob = ChannelPeer::new(right.clone());

        // A call into a channel that never answers.
        bob.register_channel(
            "stuck",
            Arc::new(ChannelRegistry::new().on_call_raw(
                "forever",
                |_arg, token| async move {
                    token.cancelled().await;
                    Err(crate::error::CallError::Cancelled)
                },
            )),
        );

        let pending = alice.channel("stuck").call("forever", Body::Undefined);
        tokio::task::yield_now().await;

        // Kill the transport from bob's side in both directions.
        right.close();
        drop(bob);

        assert!(matches!(pending.await, Err(WiremuxError::Disposed)));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (left, _right) = MemTransport::pair();
        let peer = ChannelPeer::new(left);
        peer.dispose();
        peer.dispose();
    }
}
