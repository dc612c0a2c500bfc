//! Session orchestration core for an intercepting message proxy.
//!
//! This crate sits between a client and the real server of a binary
//! message protocol. It intercepts the handshake to recover the session key,
//! rekeys both connections, and then relays every message in both directions
//! through a chain of [`Filter`]s that can observe, rewrite, or drop it.
//!
//! # Architecture
//!
//! ```text
//! Client  <--Connection-->  ProxySession  <--Connection-->  Server
//!                               |
//!                  [KeyCaptureFilter]  (handshake only)
//!                  [FilterChain]       (every unit, both directions)
//!                               |
//!                        SessionContext (shared by both directions)
//! ```
//!
//! The wire codec, sockets, and cipher live behind the [`Connection`] trait;
//! to this crate a message is an opaque [`MessageUnit`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pdu_proxy::{memory::MemoryConnection, HalfExchange, ProxySession};
//!
//! # async fn example() {
//! let (client, _client_peer) = MemoryConnection::new("client");
//! let (server, _server_peer) = MemoryConnection::new("server");
//!
//! let session = ProxySession::builder(Arc::new(client), Arc::new(server))
//!     .key_exchange(HalfExchange::new().client_tag(10101).server_tag(20000))
//!     .build();
//!
//! let report = session.run().await.expect("fresh session");
//! println!("session ended in {:?}", report.state);
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod filter;
pub mod key_capture;
pub mod memory;
pub mod message;
pub mod relay;
pub mod session;
#[cfg(test)]
mod test_utils;

// Re-export the primary public types at the crate root for convenience.
pub use config::SessionConfig;
pub use connection::Connection;
pub use context::SessionContext;
pub use error::{
    ChainError, ConnectionError, FilterError, HandshakeError, RelayError, SessionError,
};
pub use filter::{Filter, FilterChain, FilterContext, FilterResult};
pub use key_capture::{HalfExchange, KeyCaptureFilter, KeyExchange, KeyExchangeError, SessionKey};
pub use message::{Direction, MessageUnit};
pub use relay::{Forwarded, RelayLink};
pub use session::{
    DirectionReport, ProxySession, SessionBuilder, SessionReport, SessionState, WorkerExit,
};
