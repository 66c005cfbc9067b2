//! In-memory connected transport pair.
//!
//! Backs the test suite and in-process hosting: two `MemTransport` halves
//! exchange frames over unbounded channels, preserving delivery order.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{MessageTransport, TransportError};
use crate::BoxFuture;

/// One half of an in-memory transport pair.
pub struct MemTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl MemTransport {
    /// Create a connected pair. Frames sent on one half arrive on the other
    /// in order.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
            }),
            Arc::new(Self {
                tx: Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
            }),
        )
    }

    /// Close the outbound half. The peer drains any frames already queued,
    /// then observes end-of-stream.
    pub fn close(&self) {
        self.tx.lock().expect("transport lock poisoned").take();
    }
}

impl MessageTransport for MemTransport {
    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let guard = self.tx.lock().expect("transport lock poisoned");
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn recv(&self) -> BoxFuture<'_, Option<Bytes>> {
        Box::pin(async move { self.rx.lock().await.recv().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, b) = MemTransport::pair();

        for i in 0..5u8 {
            a.send(Bytes::copy_from_slice(&[i])).unwrap();
        }

        for i in 0..5u8 {
            assert_eq!(b.recv().await.unwrap(), Bytes::copy_from_slice(&[i]));
        }
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (a, b) = MemTransport::pair();

        a.send(Bytes::from_static(b"ping")).unwrap();
        b.send(Bytes::from_static(b"pong")).unwrap();

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (a, b) = MemTransport::pair();

        a.send(Bytes::from_static(b"last")).unwrap();
        a.close();

        assert!(a.send(Bytes::from_static(b"late")).is_err());
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert_eq!(b.recv().await, None);
    }
}
