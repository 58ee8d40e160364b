//! Two-byte length prefix framing.

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{CodecError, MessageCodec, MAX_DATAGRAM_PAYLOAD};
use crate::payload::Payload;

const HEADER_LENGTH: usize = 2;
const MAX_BODY_LENGTH: usize = MAX_DATAGRAM_PAYLOAD - HEADER_LENGTH; // 65525

/// Frame encoding that adds an unsigned big-endian short length header.
/// Bodies cannot exceed 65525 bytes so a whole frame always fits in one
/// UDP datagram.
#[derive(Debug, Clone)]
pub struct ShortHeaderCodec {
    body_length: usize,
}

impl ShortHeaderCodec {
    /// A codec for the given maximum body length.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= body_length <= 65525`.
    #[must_use]
    pub fn new(body_length: usize) -> Self {
        assert!(
            (1..=MAX_BODY_LENGTH).contains(&body_length),
            "body_length out of range 1..=65525: {body_length}"
        );
        Self { body_length }
    }

    /// A codec for the maximum supported body length.
    #[must_use]
    pub fn max() -> Self {
        Self::new(MAX_BODY_LENGTH)
    }

    fn peek_length(src: &[u8]) -> usize {
        usize::from(u16::from_be_bytes([src[0], src[1]]))
    }
}

impl MessageCodec for ShortHeaderCodec {
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
        dst.put_u16(msg.len() as u16);
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
        let length = usize::from(src.get_u16());
        assert!(src.len() >= length, "get() without a complete frame");
        slot.set_from(&src[..length])?;
        src.advance(length);
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn MessageCodec> {
        Box::new(self.clone())
    }
}
