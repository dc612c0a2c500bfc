//! The duplex connection abstraction the proxy relays between.
//!
//! A session holds two connections: the one facing the client and the one
//! facing the real server. In steady state each connection has exactly one
//! reader (the worker relaying *from* it) and one writer (the worker relaying
//! *to* it), so implementations should guard their read and write halves
//! independently rather than with one lock.

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::key_capture::SessionKey;
use crate::message::MessageUnit;

#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable name used in logs (e.g. `"client 10.0.0.4:51234"`).
    fn name(&self) -> &str;

    /// Read the next unit.
    ///
    /// Returns [`ConnectionError::EndOfStream`] once the peer has closed.
    /// This future must be cancel-safe: the session drops it when shutdown
    /// is requested, and no partially read unit may be lost to a later call.
    async fn read_next(&self) -> Result<MessageUnit, ConnectionError>;

    /// Write one unit to the peer.
    async fn write(&self, unit: MessageUnit) -> Result<(), ConnectionError>;

    /// Switch the connection's cipher state to `key`. Called exactly once per
    /// session, after the handshake and before any steady-state traffic.
    ///
    /// The client connection is rekeyed first. If the server connection then
    /// fails to rekey, the session ends without relaying anything, and the
    /// client side is left holding the new key.
    fn rekey(&self, key: &SessionKey) -> Result<(), ConnectionError>;
}
