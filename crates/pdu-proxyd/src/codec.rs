//! Length-prefixed wire framing: `tag: u16 BE | len: u32 BE | payload`.

use bytes::{Buf, BufMut, BytesMut};
use pdu_proxy::MessageUnit;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct PduCodec {
    max_frame_len: usize,
}

impl PduCodec {
    /// Create a codec that rejects frames longer than `max_frame_len`. The
    /// limit is capped at what the 32-bit length header can carry.
    pub fn new(max_frame_len: usize) -> Self {
        let max_header_len = usize::try_from(u32::MAX).unwrap_or(usize::MAX);
        Self {
            max_frame_len: max_frame_len.min(max_header_len),
        }
    }
}

impl Decoder for PduCodec {
    type Item = MessageUnit;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MessageUnit>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = u16::from_be_bytes([src[0], src[1]]);
        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(MessageUnit::new(tag, payload)))
    }
}

impl Encoder<MessageUnit> for PduCodec {
    type Error = CodecError;

    fn encode(&mut self, unit: MessageUnit, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = unit.len();
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(HEADER_LEN + len);
        dst.put_u16(unit.tag);
        // Bounded by `max_frame_len`, which never exceeds `u32::MAX`.
        dst.put_u32(len as u32);
        dst.extend_from_slice(&unit.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_for_a_complete_frame() {
        let mut codec = PduCodec::new(64);
        let mut buf = BytesMut::from(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x03, b'a'][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"bc");
        let unit = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(unit.tag, 7);
        assert_eq!(&unit.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = PduCodec::new(64);
        let mut buf = BytesMut::new();
        codec.encode(MessageUnit::new(1, &b"x"[..]), &mut buf).unwrap();
        codec.encode(MessageUnit::new(2, &b""[..]), &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_LEN * 2 + 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().tag, 1);
        let empty = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(empty.tag, 2);
        assert!(empty.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_header_before_buffering_payload() {
        let mut codec = PduCodec::new(4);
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05][..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 5, max: 4 }));
    }

    #[test]
    fn frame_limit_fits_the_length_header() {
        assert_eq!(PduCodec::new(usize::MAX).max_frame_len, u32::MAX as usize);
        assert_eq!(PduCodec::new(1 << 20).max_frame_len, 1 << 20);
    }

    #[test]
    fn refuses_to_encode_oversized_unit() {
        let mut codec = PduCodec::new(2);
        let mut buf = BytesMut::new();

        assert!(codec.encode(MessageUnit::new(1, &b"abc"[..]), &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
