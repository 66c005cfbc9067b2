//! Channel adapters: delayed and next-tick.
//!
//! A [`DelayedChannel`] fronts a channel that does not exist yet - a future
//! that will yield one - behind the same call/listen interface, queueing
//! work until resolution. A [`NextTickChannel`] defers the first call or
//! listen by one scheduler tick to break synchronous re-entrancy when the
//! underlying channel was built during a reactive callback.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::channel::{Channel, EventStream};
use crate::codec::Body;
use crate::error::CallError;
use crate::BoxFuture;

type Resolution = Result<Arc<dyn Channel>, CallError>;

/// A channel backed by a future that will yield the real channel.
///
/// Calls and subscriptions issued before resolution are parked on the
/// resolution signal and dispatched once it fires. Cancelling an outer call
/// cancels both the wait and, once resolved, the inner call.
#[derive(Clone)]
pub struct DelayedChannel {
    rx: watch::Receiver<Option<Resolution>>,
}

impl DelayedChannel {
    /// Wrap a future that resolves to a channel.
    pub fn new<F>(channel: F) -> Self
    where
        F: Future<Output = Resolution> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let resolution = channel.await;
            let _ = tx.send(Some(resolution));
        });
        Self { rx }
    }

    async fn resolved(&self) -> Resolution {
        let mut rx = self.rx.clone();
        loop {
            if let Some(resolution) = rx.borrow().clone() {
                return resolution;
            }
            if rx.changed().await.is_err() {
                return Err(CallError::Disposed);
            }
        }
    }
}

impl Channel for DelayedChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>> {
        let this = self.clone();
        let command = command.to_owned();
        Box::pin(async move {
            let channel = tokio::select! {
                resolution = this.resolved() => resolution?,
                _ = token.cancelled() => return Err(CallError::Cancelled),
            };
            channel.call(&command, arg, token).await
        })
    }

    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError> {
        // One-shot relay: the subscriber gets a stream immediately; values
        // flow through once the inner channel resolves and is subscribed.
        let (tx, stream) = EventStream::channel();
        let this = self.clone();
        let event = event.to_owned();
        tokio::spawn(async move {
            let channel = tokio::select! {
                resolution = this.resolved() => match resolution {
                    Ok(channel) => channel,
                    Err(err) => {
                        tracing::warn!(%err, "delayed channel failed to resolve");
                        return;
                    }
                },
                // Subscriber went away while waiting; never subscribe.
                _ = tx.closed() => return,
            };

            let mut inner = match channel.listen(&event, arg) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(%err, %event, "delayed listen rejected");
                    return;
                }
            };

            loop {
                tokio::select! {
                    // Dropping the outer stream tears down the inner
                    // subscription (and its EventDispose) with it.
                    _ = tx.closed() => break,
                    value = inner.recv() => match value {
                        Some(value) => {
                            if tx.send(value).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(stream)
    }
}

/// Defers the first call or listen by one scheduler tick; subsequent
/// operations go straight through.
pub struct NextTickChannel {
    inner: Arc<dyn Channel>,
    ticked: AtomicBool,
}

impl NextTickChannel {
    /// Wrap a channel.
    pub fn new(inner: Arc<dyn Channel>) -> Self {
        Self {
            inner,
            ticked: AtomicBool::new(false),
        }
    }

    fn first_use(&self) -> bool {
        !self.ticked.swap(true, Ordering::AcqRel)
    }
}

impl Channel for NextTickChannel {
    fn call(
        &self,
        command: &str,
        arg: Body,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Body, CallError>> {
        let inner = self.inner.clone();
        let command = command.to_owned();
        let first = self.first_use();
        Box::pin(async move {
            if first {
                tokio::task::yield_now().await;
            }
            inner.call(&command, arg, token).await
        })
    }

    fn listen(&self, event: &str, arg: Body) -> Result<EventStream, CallError> {
        if self.first_use() {
            let inner = self.inner.clone();
            DelayedChannel::new(async move {
                tokio::task::yield_now().await;
                Ok(inner)
            })
            .listen(event, arg)
        } else {
            self.inner.listen(event, arg)
        }
    }
}
