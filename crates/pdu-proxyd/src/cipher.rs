//! Per-direction frame encryption installed on rekey.
//!
//! Each direction gets its own ChaCha20-Poly1305 key, derived as
//! `SHA-256(session key || direction label)`, and its own frame counter. The
//! nonce is four zero bytes followed by the counter in big-endian order. The
//! frame tag is authenticated as associated data.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use pdu_proxy::{Direction, SessionKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption of frame {counter} failed")]
    Seal { counter: u64 },

    #[error("frame {counter} failed authentication")]
    Open { counter: u64 },

    #[error("frame counter exhausted")]
    Exhausted,
}

pub struct FrameCipher {
    aead: ChaCha20Poly1305,
    counter: u64,
}

impl FrameCipher {
    /// Derive the cipher for traffic flowing in `direction`.
    pub fn derive(key: &SessionKey, direction: Direction) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(direction.as_str().as_bytes());
        let digest = hasher.finalize();

        Self {
            aead: ChaCha20Poly1305::new(&digest),
            counter: 0,
        }
    }

    pub fn seal(&mut self, tag: u16, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let counter = self.next_counter()?;
        let aad = tag.to_be_bytes();
        self.aead
            .encrypt(
                &nonce(counter),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Seal { counter })
    }

    pub fn open(&mut self, tag: u16, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let counter = self.next_counter()?;
        let aad = tag.to_be_bytes();
        self.aead
            .decrypt(
                &nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| CipherError::Open { counter })
    }

    // The counter advances even when a frame fails authentication, so a
    // peer cannot replay a nonce by sending garbage first.
    fn next_counter(&mut self) -> Result<u64, CipherError> {
        let counter = self.counter;
        self.counter = counter.checked_add(1).ok_or(CipherError::Exhausted)?;
        Ok(counter)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

fn nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG_SIZE: usize = 16;

    fn key() -> SessionKey {
        SessionKey::new(&b"client-half|server-half"[..])
    }

    #[test]
    fn sealed_frames_open_in_sequence() {
        let mut sender = FrameCipher::derive(&key(), Direction::ClientToServer);
        let mut receiver = FrameCipher::derive(&key(), Direction::ClientToServer);

        let first = sender.seal(3, b"hello").unwrap();
        let second = sender.seal(3, b"hello").unwrap();
        assert_ne!(first, second);
        assert_eq!(first.len(), 5 + TAG_SIZE);

        assert_eq!(receiver.open(3, &first).unwrap(), b"hello");
        assert_eq!(receiver.open(3, &second).unwrap(), b"hello");
        assert_eq!(receiver.counter, 2);
    }

    #[test]
    fn directions_use_distinct_keys() {
        let mut upstream = FrameCipher::derive(&key(), Direction::ClientToServer);
        let mut downstream = FrameCipher::derive(&key(), Direction::ServerToClient);

        let sealed = upstream.seal(1, b"ping").unwrap();
        assert_eq!(
            downstream.open(1, &sealed),
            Err(CipherError::Open { counter: 0 })
        );
    }

    #[test]
    fn tag_is_authenticated() {
        let mut sender = FrameCipher::derive(&key(), Direction::ServerToClient);
        let mut receiver = FrameCipher::derive(&key(), Direction::ServerToClient);

        let sealed = sender.seal(1, b"ping").unwrap();
        assert!(receiver.open(2, &sealed).is_err());
    }

    #[test]
    fn out_of_order_frame_is_rejected() {
        let mut sender = FrameCipher::derive(&key(), Direction::ClientToServer);
        let mut receiver = FrameCipher::derive(&key(), Direction::ClientToServer);

        let _skipped = sender.seal(1, b"a").unwrap();
        let second = sender.seal(1, b"b").unwrap();
        assert!(receiver.open(1, &second).is_err());
    }
}
