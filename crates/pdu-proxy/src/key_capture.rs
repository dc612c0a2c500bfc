//! Handshake key capture.
//!
//! The first unit each side sends carries that side's half of the session
//! key. [`KeyCaptureFilter`] watches for those two units, asks a
//! [`KeyExchange`] to pull the halves out, and combines them once both are
//! present. It never drops or rewrites traffic; the handshake units still
//! reach their destination untouched.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::FilterError;
use crate::filter::{Filter, FilterContext, FilterResult};
use crate::message::{Direction, MessageUnit};

/// Key material negotiated during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Bytes);

impl SessionKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(<{} bytes>)", self.0.len())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("expected handshake tag {expected}, got {actual}")]
    UnexpectedTag { expected: u16, actual: u16 },

    #[error("handshake unit carries no key material")]
    EmptyHalf,

    #[error("key half must be {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Protocol-specific knowledge of where the key halves live.
pub trait KeyExchange: Send + Sync {
    /// Pull this direction's half out of its first unit.
    fn extract(&self, unit: &MessageUnit, direction: Direction)
        -> Result<Bytes, KeyExchangeError>;

    /// Combine both halves into the session key.
    fn combine(&self, client_half: &[u8], server_half: &[u8]) -> SessionKey;
}

/// A [`KeyExchange`] where each handshake payload *is* the key half and the
/// session key is `client_half || server_half`.
///
/// Tags and half length are optional constraints; a unit that violates them
/// is treated as a malformed handshake.
#[derive(Debug, Clone, Default)]
pub struct HalfExchange {
    client_tag: Option<u16>,
    server_tag: Option<u16>,
    half_len: Option<usize>,
}

impl HalfExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_tag(mut self, tag: u16) -> Self {
        self.client_tag = Some(tag);
        self
    }

    pub fn server_tag(mut self, tag: u16) -> Self {
        self.server_tag = Some(tag);
        self
    }

    pub fn half_len(mut self, len: usize) -> Self {
        self.half_len = Some(len);
        self
    }
}

impl KeyExchange for HalfExchange {
    fn extract(
        &self,
        unit: &MessageUnit,
        direction: Direction,
    ) -> Result<Bytes, KeyExchangeError> {
        let expected_tag = match direction {
            Direction::ClientToServer => self.client_tag,
            Direction::ServerToClient => self.server_tag,
        };
        if let Some(expected) = expected_tag {
            if unit.tag != expected {
                return Err(KeyExchangeError::UnexpectedTag {
                    expected,
                    actual: unit.tag,
                });
            }
        }

        if unit.payload.is_empty() {
            return Err(KeyExchangeError::EmptyHalf);
        }

        if let Some(expected) = self.half_len {
            if unit.payload.len() != expected {
                return Err(KeyExchangeError::WrongLength {
                    expected,
                    actual: unit.payload.len(),
                });
            }
        }

        Ok(unit.payload.clone())
    }

    fn combine(&self, client_half: &[u8], server_half: &[u8]) -> SessionKey {
        let mut key = Vec::with_capacity(client_half.len() + server_half.len());
        key.extend_from_slice(client_half);
        key.extend_from_slice(server_half);
        SessionKey::new(key)
    }
}

#[derive(Default)]
struct Halves {
    client_seen: bool,
    server_seen: bool,
    client: Option<Bytes>,
    server: Option<Bytes>,
}

/// Captures the session key from the first unit in each direction.
///
/// Only the first unit per direction is considered. If that unit is
/// malformed the half stays missing and [`key`](Self::key) never returns a
/// value. Once set, the key cannot change.
pub struct KeyCaptureFilter {
    exchange: Arc<dyn KeyExchange>,
    halves: Mutex<Halves>,
    key: OnceLock<SessionKey>,
}

impl KeyCaptureFilter {
    pub const NAME: &'static str = "key-capture";

    pub fn new(exchange: impl KeyExchange + 'static) -> Self {
        Self::with_exchange(Arc::new(exchange))
    }

    pub fn with_exchange(exchange: Arc<dyn KeyExchange>) -> Self {
        Self {
            exchange,
            halves: Mutex::new(Halves::default()),
            key: OnceLock::new(),
        }
    }

    /// Inspect `unit` without altering it.
    pub fn observe(&self, unit: &MessageUnit, direction: Direction) {
        let mut halves = self.halves.lock().unwrap_or_else(PoisonError::into_inner);

        let seen = match direction {
            Direction::ClientToServer => &mut halves.client_seen,
            Direction::ServerToClient => &mut halves.server_seen,
        };
        if *seen {
            return;
        }
        *seen = true;

        match self.exchange.extract(unit, direction) {
            Ok(half) => {
                debug!(%direction, len = half.len(), "captured key half");
                match direction {
                    Direction::ClientToServer => halves.client = Some(half),
                    Direction::ServerToClient => halves.server = Some(half),
                }
            }
            Err(err) => {
                warn!(%direction, tag = unit.tag, %err, "malformed handshake unit");
                return;
            }
        }

        if let (Some(client), Some(server)) = (&halves.client, &halves.server) {
            let key = self.exchange.combine(client, server);
            // Only reachable once per filter: both `seen` flags are now set.
            let _ = self.key.set(key);
        }
    }

    /// The combined key, once both halves have been captured.
    pub fn key(&self) -> Option<SessionKey> {
        self.key.get().cloned()
    }
}

impl Filter for KeyCaptureFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(
        &self,
        unit: MessageUnit,
        ctx: &FilterContext<'_>,
    ) -> Result<FilterResult, FilterError> {
        self.observe(&unit, ctx.direction());
        Ok(FilterResult::Forward(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(tag: u16, payload: &'static [u8]) -> MessageUnit {
        MessageUnit::new(tag, payload)
    }

    #[test]
    fn key_absent_until_both_halves_seen() {
        let filter = KeyCaptureFilter::new(HalfExchange::new());

        filter.observe(&unit(1, b"AAAA"), Direction::ClientToServer);
        assert!(filter.key().is_none());

        filter.observe(&unit(2, b"BBBB"), Direction::ServerToClient);
        assert_eq!(filter.key().unwrap().as_bytes(), b"AAAABBBB");
    }

    #[test]
    fn server_half_first_still_combines_client_first() {
        let filter = KeyCaptureFilter::new(HalfExchange::new());

        filter.observe(&unit(2, b"srv"), Direction::ServerToClient);
        assert!(filter.key().is_none());
        filter.observe(&unit(1, b"cli"), Direction::ClientToServer);

        assert_eq!(filter.key().unwrap().as_bytes(), b"clisrv");
    }

    #[test]
    fn only_first_unit_per_direction_counts() {
        let filter = KeyCaptureFilter::new(HalfExchange::new());

        filter.observe(&unit(1, b"first"), Direction::ClientToServer);
        filter.observe(&unit(1, b"second"), Direction::ClientToServer);
        filter.observe(&unit(2, b"S"), Direction::ServerToClient);
        filter.observe(&unit(2, b"later"), Direction::ServerToClient);

        assert_eq!(filter.key().unwrap().as_bytes(), b"firstS");
    }

    #[test]
    fn malformed_first_unit_leaves_key_absent() {
        let exchange = HalfExchange::new().client_tag(10101).server_tag(20000);
        let filter = KeyCaptureFilter::new(exchange);

        filter.observe(&unit(999, b"not-a-login"), Direction::ClientToServer);
        // A well-formed retry is ignored: the first client unit was the handshake.
        filter.observe(&unit(10101, b"login"), Direction::ClientToServer);
        filter.observe(&unit(20000, b"key"), Direction::ServerToClient);

        assert!(filter.key().is_none());
    }

    #[test]
    fn half_exchange_checks_tag_and_length() {
        let exchange = HalfExchange::new().client_tag(5).half_len(4);

        assert_eq!(
            exchange.extract(&unit(6, b"abcd"), Direction::ClientToServer),
            Err(KeyExchangeError::UnexpectedTag {
                expected: 5,
                actual: 6
            })
        );
        assert_eq!(
            exchange.extract(&unit(5, b"abc"), Direction::ClientToServer),
            Err(KeyExchangeError::WrongLength {
                expected: 4,
                actual: 3
            })
        );
        assert_eq!(
            exchange.extract(&unit(5, b""), Direction::ClientToServer),
            Err(KeyExchangeError::EmptyHalf)
        );
        // No server tag configured: any tag is accepted.
        assert!(exchange
            .extract(&unit(77, b"wxyz"), Direction::ServerToClient)
            .is_ok());
    }

    #[test]
    fn session_key_debug_is_redacted() {
        let key = SessionKey::new(vec![0xde, 0xad]);
        assert_eq!(format!("{key:?}"), "SessionKey(<2 bytes>)");
    }
}
