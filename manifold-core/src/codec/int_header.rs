//! Four-byte length prefix framing.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{CodecError, MessageCodec};
use crate::payload::Payload;

const HEADER_LENGTH: usize = 4;
/// Bodies up to `2^31 - 5`: the length field stays a positive signed
/// 32-bit value and header plus body stays under `2^31 - 1`.
const MAX_BODY_LENGTH: usize = (i32::MAX as usize) - HEADER_LENGTH;

/// Frame encoding with an int length header. Bodies cannot be longer
/// than `2^31 - 5` bytes, or 65531 when frames must fit a UDP datagram.
#[derive(Debug, Clone)]
pub struct IntHeaderCodec {
    body_length: usize,
}

impl IntHeaderCodec {
    /// A codec for the given maximum body length.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= body_length <= 2^31 - 5`.
    #[must_use]
    pub fn new(body_length: usize) -> Self {
        assert!(
            (1..=MAX_BODY_LENGTH).contains(&body_length),
            "body_length out of range 1..=2^31-5: {body_length}"
        );
        Self { body_length }
    }

    fn peek_length(src: &[u8]) -> usize {
        u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
    }
}

impl MessageCodec for IntHeaderCodec {
    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        0
    }

    fn encoded_length(&self, msg: &[u8]) -> usize {
        HEADER_LENGTH + msg.len()
    }

    fn put(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        self.is_valid(msg)?;
        dst.reserve(HEADER_LENGTH + msg.len());
        dst.put_u32(msg.len() as u32);
        dst.extend_from_slice(msg);
        Ok(())
    }

    fn has_next(&mut self, src: &[u8]) -> Result<bool, CodecError> {
        if src.len() < HEADER_LENGTH {
            return Ok(false);
        }
        let length = Self::peek_length(src);
        if length < 1 || length > self.body_length {
            return Err(CodecError::InvalidLength {
                length,
                limit: self.body_length,
            });
        }
        Ok(src.len() >= HEADER_LENGTH + length)
    }

    fn decoded_length(&self, src: &[u8]) -> usize {
        Self::peek_length(src)
    }

    fn get(&mut self, src: &mut BytesMut, slot: &mut Payload) -> Result<(), CodecError> {
        assert!(src.len() >= HEADER_LENGTH, "get() without a complete frame");
        let length = src.get_u32() as usize;
        assert!(src.len() >= length, "get() without a complete frame");
        slot.set_from(&src[..length])?;
        src.advance(length);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn MessageCodec> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_big_endian() {
        let mut codec = IntHeaderCodec::new(1 << 20);
        let mut wire = BytesMut::new();
        codec.put(b"abc", &mut wire).unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn large_body_round_trip() {
        let mut codec = IntHeaderCodec::new(1 << 20);
        let body = vec![0x5A; 1 << 20];
        let mut wire = BytesMut::new();
        codec.put(&body, &mut wire).unwrap();

        assert!(codec.has_next(&wire).unwrap());
        assert_eq!(codec.decoded_length(&wire), body.len());
        let mut slot = Payload::with_capacity(1 << 20);
        codec.get(&mut wire, &mut slot).unwrap();
        assert_eq!(slot.as_slice(), &body[..]);
    }
}
