use thiserror::Error;

/// Failures reported by a [`Connection`](crate::connection::Connection).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The source has no more units. Normal termination for a direction.
    #[error("end of stream")]
    EndOfStream,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The wire codec could not turn bytes into a unit (or back).
    #[error("codec error: {0}")]
    Codec(String),

    #[error("rekey failed: {0}")]
    Rekey(String),
}

/// Raised by a filter that cannot process a unit. Ends the direction it
/// happened in (or the handshake, if it happened there).
#[derive(Debug, Error)]
#[error("filter '{filter}' failed: {reason}")]
pub struct FilterError {
    pub filter: String,
    pub reason: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("no filter named '{anchor}' in the chain")]
    AnchorNotFound { anchor: String },
}

/// Why one unit could not be relayed by a [`RelayLink`](crate::relay::RelayLink).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{connection} at end of stream")]
    EndOfStream { connection: String },

    #[error("read from {connection} failed: {source}")]
    Read {
        connection: String,
        #[source]
        source: ConnectionError,
    },

    #[error("write to {connection} failed: {source}")]
    Write {
        connection: String,
        #[source]
        source: ConnectionError,
    },

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Fatal handshake outcomes. Any of these ends the session before relaying
/// starts.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake relay failed: {0}")]
    Relay(#[from] RelayError),

    #[error("key exchange did not complete")]
    KeyNotCaptured,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("rekey of {connection} failed: {source}")]
    Rekey {
        connection: String,
        #[source]
        source: ConnectionError,
    },

    #[error("handshake timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("handshake cancelled by shutdown")]
    Cancelled,
}

impl HandshakeError {
    /// Whether the handshake stopped because shutdown was requested rather
    /// than because something went wrong.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} has already been started")]
    AlreadyStarted(uuid::Uuid),
}
