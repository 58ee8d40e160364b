//! Checksummed framing.
//!
//! The int-header frame with a four-byte digest of the body appended as
//! a footer. A digest mismatch on decode means the body was corrupted in
//! flight and the channel must not deliver it.

use bytes::{Buf, BufMut, BytesMut};
use twox_hash::XxHash32;

use crate::codec::{CodecError, MessageCodec};
use crate::payload::Payload;

const HEADER_LENGTH: usize = 4;
const FOOTER_LENGTH: usize = 4;
const MAX_BODY_LENGTH: usize = (i32::MAX as usize) - HEADER_LENGTH - FOOTER_LENGTH;

const XXHASH_SEED: u32 = 0;

/// Digest algorithm for the frame footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc32,
    Adler32,
    XxHash,
}

impl ChecksumKind {
    fn digest(self, data: &[u8]) -> u32 {
        match self {
            Self::Crc32 => crc32fast::hash(data),
            Self::Adler32 => adler2::adler32_slice(data),
            Self::XxHash => XxHash32::oneshot(XXHASH_SEED, data),
        }
    }
}

/// Int-header framing with a digest footer over the body. Bodies cannot
/// be longer than 65519 bytes when frames must fit a UDP datagram.
#[derive(Debug, Clone)]
pub struct ChecksumCodec {
    body_length: usize,
    kind: ChecksumKind,
}

impl ChecksumCodec {
    /// A codec for the given maximum body length and digest algorithm.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= body_length <= 2^31 - 9`.
    #[must_use]
    pub fn new(body_length: usize, kind: ChecksumKind) -> Self {
        assert!(
            (1..=MAX_BODY_LENGTH).contains(&body_length),
            "body_length out of range 1..=2^31-9: {body_length}"
        );
        Self { body_length, kind }
    }

    fn peek_length(src: &[u8]) -> usize {
        u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
    }
}

impl MessageCodec for ChecksumCodec {
    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        FOOTER_LENGTH
    }

    fn encoded_length(&self, msg: &[u8]) -> usize {
        HEADER_LENGTH + msg.len() + FOOTER_LENGTH
    }

    fn put(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        self.is_valid(msg)?;
        dst.reserve(HEADER_LENGTH + msg.len() + FOOTER_LENGTH);
        dst.put_u32(msg.len() as u32);
        dst.extend_from_slice(msg);
        dst.put_u32(self.kind.digest(msg));
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
        Ok(src.len() >= HEADER_LENGTH + length + FOOTER_LENGTH)
    }

    fn decoded_length(&self, src: &[u8]) -> usize {
        Self::peek_length(src)
    }

    fn get(&mut self, src: &mut BytesMut, slot: &mut Payload) -> Result<(), CodecError> {
        assert!(src.len() >= HEADER_LENGTH, "get() without a complete frame");
        let length = src.get_u32() as usize;
        assert!(
            src.len() >= length + FOOTER_LENGTH,
            "get() without a complete frame"
        );

        let expected = self.kind.digest(&src[..length]);
        slot.set_from(&src[..length])?;
        src.advance(length);
        let received = src.get_u32();

        if received != expected {
            slot.clear();
            return Err(CodecError::InvalidEncoding("checksum mismatch"));
        }
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
    fn digest_algorithms_disagree() {
        let body = b"same body, different footer";
        assert_ne!(
            ChecksumKind::Crc32.digest(body),
            ChecksumKind::Adler32.digest(body)
        );
        assert_ne!(
            ChecksumKind::Crc32.digest(body),
            ChecksumKind::XxHash.digest(body)
        );
    }

    #[test]
    fn single_bit_flip_is_rejected() {
        for kind in [ChecksumKind::Crc32, ChecksumKind::Adler32, ChecksumKind::XxHash] {
            let mut codec = ChecksumCodec::new(1024, kind);
            let mut wire = BytesMut::new();
            codec.put(b"hello world", &mut wire).unwrap();

            // Flip one payload bit on the wire.
            wire[HEADER_LENGTH + 3] ^= 0x01;

            assert!(codec.has_next(&wire).unwrap());
            let mut slot = Payload::with_capacity(1024);
            assert_eq!(
                codec.get(&mut wire, &mut slot),
                Err(CodecError::InvalidEncoding("checksum mismatch"))
            );
            assert!(slot.is_empty());
        }
    }

    #[test]
    fn footer_must_be_complete() {
        let mut codec = ChecksumCodec::new(1024, ChecksumKind::Crc32);
        let mut wire = BytesMut::new();
        codec.put(b"abc", &mut wire).unwrap();
        // Header and body present, footer truncated: not yet a frame.
        assert!(!codec.has_next(&wire[..wire.len() - 1]).unwrap());
    }
}
