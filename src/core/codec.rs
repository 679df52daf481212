//! Framing for direct socket connections.
//!
//! ```text
//! [Length(i32)] [Encrypted(1)] [Payload(N)]
//! ```
//!
//! The length counts the payload only. Frames larger than the configured limit
//! are rejected before any allocation.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const HEADER_LEN: usize = 5;

/// One frame on a direct connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub encrypted: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>, encrypted: bool) -> Self {
        Self {
            encrypted,
            payload: payload.into(),
        }
    }
}

/// Length-prefixed frame codec with an encryption flag
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let length = usize::try_from(length).map_err(|_| ProtocolError::InvalidLength(length))?;
        if length > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(length));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let encrypted = src.get_u8() == 1;
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { encrypted, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_i32(item.payload.len() as i32);
        dst.put_u8(u8::from(item.encrypted));
        dst.put_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(Bytes::from_static(b"abc"), true), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, 1, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 3, 0, b'a'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"bc");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(!frame.encrypted);
        assert_eq!(&frame.payload[..], b"abc");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::new(Bytes::from_static(b"1"), false), &mut buf).unwrap();
        codec.encode(Frame::new(Bytes::from_static(b"22"), true), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], b"1");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert!(second.encrypted);
        assert_eq!(&second.payload[..], b"22");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::from(&[0u8, 0, 0x10, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(4096))
        ));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0xffu8, 0xff, 0xff, 0xfe, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidLength(-2))
        ));
    }
}
