use std::fmt;

use bytes::Bytes;

/// One decoded protocol message.
///
/// The core never looks inside `payload`; the `tag` is the codec's message
/// type identifier and is only read by filters (and by key exchanges that
/// need to recognise handshake messages).
#[derive(Clone, PartialEq, Eq)]
pub struct MessageUnit {
    pub tag: u16,
    pub payload: Bytes,
}

impl MessageUnit {
    /// Create a unit from its type tag and payload bytes.
    pub fn new(tag: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Returns a copy of this unit with the payload replaced.
    pub fn with_payload(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: self.tag,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl fmt::Debug for MessageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageUnit")
            .field("tag", &self.tag)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Direction of message flow through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client -> server
    ClientToServer,
    /// Server -> client
    ServerToClient,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Self::ClientToServer => Self::ServerToClient,
            Self::ServerToClient => Self::ClientToServer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToServer => "client->server",
            Self::ServerToClient => "server->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
