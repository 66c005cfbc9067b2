//! # wiremux
//!
//! A bidirectional request/response and event-subscription multiplexer over
//! any reliable, message-oriented, in-order frame transport: a pipe to a
//! child process, a named socket, a WebSocket-like channel.
//!
//! Two peers expose *channels* - named collections of remotely invokable
//! commands and subscribable events - to each other, issue concurrent
//! requests with cancellation, and stream long-lived event subscriptions.
//! A multi-client server can route calls from one peer to another through a
//! pluggable [`Router`].
//!
//! ## Architecture
//!
//! - Each side of a transport runs a [`ChannelServer`] (dispatches incoming
//!   requests to registered channels) and a [`ChannelClient`] (issues
//!   requests, correlates responses by id). [`ChannelPeer`] co-hosts both.
//! - The server engine's first frame is the `Initialize` marker; the client
//!   engine buffers outbound requests until it arrives, so early calls are
//!   safe.
//! - [`MuxServer`] hosts one engine pair per connected peer and resolves
//!   outgoing calls to a specific peer via a caller-supplied [`Router`].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wiremux::{Body, ChannelPeer, ChannelRegistry, MemTransport};
//!
//! let (left, right) = MemTransport::pair();
//! let serving = ChannelPeer::new(right);
//! serving.register_channel(
//!     "echo",
//!     Arc::new(ChannelRegistry::new().on_call_raw("marco", |_arg, _token| async move {
//!         Ok(Body::from("polo"))
//!     })),
//! );
//!
//! let calling = ChannelPeer::new(left);
//! let reply = calling.channel("echo").call("marco", Body::Undefined).await?;
//! assert_eq!(reply, Body::from("polo"));
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod adapter;
pub mod channel;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod transport;

mod client;
mod peer;
mod router;
mod server;

pub use adapter::{DelayedChannel, NextTickChannel};
pub use channel::{Channel, EventStream};
pub use client::{ChannelClient, ClientChannel, PendingCall};
pub use codec::Body;
pub use error::{CallError, RemoteError, WiremuxError};
pub use handler::ChannelRegistry;
pub use peer::ChannelPeer;
pub use router::{MuxServer, Router};
pub use server::ChannelServer;
pub use transport::{MemTransport, MessageTransport, TransportError};

/// Re-export: the cancellation token handed to channel command handlers.
pub use tokio_util::sync::CancellationToken;

/// Boxed future used across channel and transport seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
