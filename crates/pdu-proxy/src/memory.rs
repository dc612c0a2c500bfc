//! In-process [`Connection`] backed by tokio channels.
//!
//! Each [`MemoryConnection`] comes with a [`MemoryPeer`] that plays the remote
//! endpoint: units the peer sends are what the proxy reads, and units the
//! proxy writes show up in the peer's receiver. Embedders use it to drive a
//! session without sockets; the crate's own tests use it throughout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::key_capture::SessionKey;
use crate::message::MessageUnit;

#[derive(Default)]
struct Shared {
    rekeys: Mutex<Vec<SessionKey>>,
    fail_writes: AtomicBool,
}

pub struct MemoryConnection {
    name: String,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageUnit>>,
    outbound: mpsc::UnboundedSender<MessageUnit>,
    shared: Arc<Shared>,
}

/// The remote end of a [`MemoryConnection`].
pub struct MemoryPeer {
    to_proxy: Option<mpsc::UnboundedSender<MessageUnit>>,
    from_proxy: mpsc::UnboundedReceiver<MessageUnit>,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    pub fn new(name: impl Into<String>) -> (Self, MemoryPeer) {
        let (to_proxy, inbound) = mpsc::unbounded_channel();
        let (outbound, from_proxy) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let conn = Self {
            name: name.into(),
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            shared: Arc::clone(&shared),
        };
        let peer = MemoryPeer {
            to_proxy: Some(to_proxy),
            from_proxy,
            shared,
        };
        (conn, peer)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_next(&self) -> Result<MessageUnit, ConnectionError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(ConnectionError::EndOfStream)
    }

    async fn write(&self, unit: MessageUnit) -> Result<(), ConnectionError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer refused write",
            )
            .into());
        }
        self.outbound.send(unit).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer receiver dropped").into()
        })
    }

    fn rekey(&self, key: &SessionKey) -> Result<(), ConnectionError> {
        self.shared
            .rekeys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key.clone());
        Ok(())
    }
}

impl MemoryPeer {
    /// Queue a unit for the proxy to read. Returns `false` once the peer has
    /// been closed or the connection dropped.
    pub fn send(&self, unit: MessageUnit) -> bool {
        match &self.to_proxy {
            Some(tx) => tx.send(unit).is_ok(),
            None => false,
        }
    }

    /// Signal end of stream to the proxy side. Units already queued are
    /// still delivered first.
    pub fn close(&mut self) {
        self.to_proxy = None;
    }

    /// Wait for the next unit the proxy wrote. `None` once the connection
    /// has been dropped and everything written has been drained.
    pub async fn recv(&mut self) -> Option<MessageUnit> {
        self.from_proxy.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<MessageUnit> {
        self.from_proxy.try_recv().ok()
    }

    /// Every key the proxy installed on this connection, in order.
    pub fn rekeys(&self) -> Vec<SessionKey> {
        self.shared
            .rekeys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every subsequent proxy write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.shared.fail_writes.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_send_is_read_by_proxy_side() {
        let (conn, peer) = MemoryConnection::new("client");
        assert!(peer.send(MessageUnit::new(7, &b"hi"[..])));

        let unit = conn.read_next().await.unwrap();
        assert_eq!(unit.tag, 7);
        assert_eq!(conn.name(), "client");
    }

    #[tokio::test]
    async fn close_drains_then_reports_end_of_stream() {
        let (conn, mut peer) = MemoryConnection::new("client");
        peer.send(MessageUnit::new(1, &b"a"[..]));
        peer.close();

        assert!(conn.read_next().await.is_ok());
        assert!(matches!(
            conn.read_next().await,
            Err(ConnectionError::EndOfStream)
        ));
        assert!(!peer.send(MessageUnit::new(2, &b"late"[..])));
    }

    #[tokio::test]
    async fn writes_reach_peer_until_failed() {
        let (conn, mut peer) = MemoryConnection::new("server");
        conn.write(MessageUnit::new(3, &b"x"[..])).await.unwrap();
        assert_eq!(peer.recv().await.unwrap().tag, 3);

        peer.fail_writes();
        let err = conn.write(MessageUnit::new(4, &b"y"[..])).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(_)));
        assert!(peer.try_recv().is_none());
    }

    #[test]
    fn rekey_is_recorded() {
        let (conn, peer) = MemoryConnection::new("server");
        let key = SessionKey::new(vec![1, 2, 3]);
        conn.rekey(&key).unwrap();
        assert_eq!(peer.rekeys(), vec![key]);
    }
}
