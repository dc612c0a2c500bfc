//! [`Connection`] over any byte stream using [`PduCodec`] framing.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pdu_proxy::{Connection, ConnectionError, Direction, MessageUnit, SessionKey};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::cipher::FrameCipher;
use crate::codec::{CodecError, PduCodec};

/// Which real endpoint the connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted from the game client.
    ClientFacing,
    /// Dialled to the game server.
    ServerFacing,
}

impl Role {
    /// Direction of the traffic this connection reads.
    pub fn inbound(self) -> Direction {
        match self {
            Self::ClientFacing => Direction::ClientToServer,
            Self::ServerFacing => Direction::ServerToClient,
        }
    }

    /// Direction of the traffic this connection writes.
    pub fn outbound(self) -> Direction {
        self.inbound().reverse()
    }
}

#[derive(Default)]
struct Ciphers {
    inbound: Option<FrameCipher>,
    outbound: Option<FrameCipher>,
}

pub struct FramedConnection<T> {
    name: String,
    role: Role,
    reader: tokio::sync::Mutex<SplitStream<Framed<T, PduCodec>>>,
    writer: tokio::sync::Mutex<SplitSink<Framed<T, PduCodec>, MessageUnit>>,
    ciphers: Mutex<Ciphers>,
}

impl<T> FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(name: impl Into<String>, role: Role, io: T, codec: PduCodec) -> Self {
        let (sink, stream) = Framed::new(io, codec).split();
        Self {
            name: name.into(),
            role,
            reader: tokio::sync::Mutex::new(stream),
            writer: tokio::sync::Mutex::new(sink),
            ciphers: Mutex::new(Ciphers::default()),
        }
    }

    fn ciphers(&self) -> std::sync::MutexGuard<'_, Ciphers> {
        self.ciphers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T> Connection for FramedConnection<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_next(&self) -> Result<MessageUnit, ConnectionError> {
        // `Framed` keeps partial frames in its own buffer, so dropping this
        // future between frames loses nothing.
        let frame = {
            let mut reader = self.reader.lock().await;
            reader.next().await
        };
        let unit = match frame {
            None => return Err(ConnectionError::EndOfStream),
            Some(frame) => frame.map_err(codec_error)?,
        };

        match self.ciphers().inbound.as_mut() {
            None => Ok(unit),
            Some(cipher) => {
                let plaintext = cipher
                    .open(unit.tag, &unit.payload)
                    .map_err(|e| ConnectionError::Codec(e.to_string()))?;
                Ok(unit.with_payload(plaintext))
            }
        }
    }

    async fn write(&self, unit: MessageUnit) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let unit = match self.ciphers().outbound.as_mut() {
            None => unit,
            Some(cipher) => {
                let sealed = cipher
                    .seal(unit.tag, &unit.payload)
                    .map_err(|e| ConnectionError::Codec(e.to_string()))?;
                unit.with_payload(sealed)
            }
        };
        writer.send(unit).await.map_err(codec_error)
    }

    fn rekey(&self, key: &SessionKey) -> Result<(), ConnectionError> {
        if key.is_empty() {
            return Err(ConnectionError::Rekey("empty session key".to_string()));
        }

        let mut ciphers = self.ciphers();
        if ciphers.inbound.is_some() || ciphers.outbound.is_some() {
            return Err(ConnectionError::Rekey(format!(
                "{} is already rekeyed",
                self.name
            )));
        }
        ciphers.inbound = Some(FrameCipher::derive(key, self.role.inbound()));
        ciphers.outbound = Some(FrameCipher::derive(key, self.role.outbound()));
        tracing::debug!(connection = %self.name, role = ?self.role, "frame encryption enabled");
        Ok(())
    }
}

fn codec_error(err: CodecError) -> ConnectionError {
    match err {
        CodecError::Io(err) => ConnectionError::Io(err),
        other => ConnectionError::Codec(other.to_string()),
    }
}
