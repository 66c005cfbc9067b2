//! Registry-backed channel construction.
//!
//! [`ChannelRegistry`] maps command and event names to handlers and
//! implements [`Channel`] directly, so it can be registered on any server
//! engine. Typed registration deserializes the argument and serializes the
//! result through serde; raw registration works on [`Body`] values.
//!
//! # Example
//!
//! ```ignore
//! use wiremux::{Body, ChannelRegistry};
//!
//! let channel = ChannelRegistry::new()
//!     .on_call("marco", |(), _token| async move { Ok("polo".to_owned()) })
//!     .on_event("pong", |_arg| {
//!         let (tx, stream) = wiremux::EventStream::channel();
//!         tx.send(Body::from("hello")).ok();
//!         stream
//!     });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, EventStream};
use crate::codec::Body;
use crate::error::{CallError, RemoteError};
use crate::BoxFuture;

type CommandFn =
    Arc<dyn Fn(Body, CancellationToken) -> BoxFuture<'static, Result<Body, CallError>> + Send + Sync>;
type EventFn = Arc<dyn Fn(Body) -> EventStream + Send + Sync>;

/// A [`Channel`] assembled from named command handlers and event sources.
///
/// Unknown command and event names produce the not-implemented rejection.
#[derive(Default)]
pub struct ChannelRegistry {
    commands: HashMap<String, CommandFn>,
    events: HashMap<String, EventFn>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed command handler.
    ///
    /// The argument body is deserialized into `T` and the returned value
    /// serialized back into a structured body.
    pub fn on_call<F, T, U, Fut>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        U: Serialize,
        Fut: Future<Output = Result<U, CallError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: CommandFn = Arc::new(move |arg: Body, token: CancellationToken| {
            let handler = handler.clone();
            Box::pin(async move {
                let parsed: T = arg.deserialize().map_err(|err| {
                    CallError::Failed(RemoteError::new(
                        "TypeError",
                        format!("invalid argument: {err}"),
                    ))
                })?;
                let value = (*handler)(parsed, token).await?;
                Body::json(&value).map_err(|err| {
                    CallError::Failed(RemoteError::new(
                        "TypeError",
                        format!("unserializable result: {err}"),
                    ))
                })
            })
        });
        self.commands.insert(command.to_owned(), wrapped);
        self
    }

    /// Register a raw command handler working directly on [`Body`] values.
    pub fn on_call_raw<F, Fut>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(Body, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Body, CallError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let wrapped: CommandFn = Arc::new(move |arg, token| {
            let handler = handler.clone();
            Box::pin(async move { (*handler)(arg, token).await })
        });
        self.commands.insert(command.to_owned(), wrapped);
        self
    }

    /// Register an event source. Each subscription invokes the source once
    /// with the subscriber's argument.
    pub fn on_event<F>(mut self, event: &str, source: F) -> Self
    where
        F: Fn(Body) -> EventStream + Send + Sync + 'static,
    {
        self.events.insert(event.to_owned(), Arc::new(source));
        self
    }
}

impl Channel for ChannelRegistry {
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>> {
        match self.commands.get(command) {
            Some(handler) => (handler.as_ref())(arg, token),
            None => {
                let message = format!("command '{command}' is not registered");
                Box::pin(async move { Err(CallError::not_implemented(message)) })
            }
        }
    }

    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError> {
        match self.events.get(event) {
            Some(source) => Ok((source.as_ref())(arg)),
            None => Err(CallError::not_implemented(format!(
                "event '{event}' is not registered"
            ))),
        }
    }
}
