//! Compressing framing.
//!
//! Both codecs compress the body first and then frame the compressed
//! block behind an int length header, so the length field on the wire
//! describes compressed bytes. Each direction keeps its own scratch
//! state; an encoder and a decoder may run concurrently on one instance
//! but two encoders (or two decoders) may not.

use bytes::{Buf, BufMut, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use lz4_flex::block;

use crate::codec::{CodecError, MessageCodec};
use crate::payload::Payload;

const HEADER_LENGTH: usize = 4;

// ============================================================================
// Deflate
// ============================================================================

/// Worst-case zlib output: 5 bytes of block overhead per 16 KiB plus the
/// stream header and trailing checksum, rounded up generously.
fn deflate_bound(len: usize) -> usize {
    len + (len >> 10) + 64
}

/// Frame encoding that compresses bodies with deflate (zlib stream).
/// Bodies cannot be longer than 65499 bytes when frames must fit a UDP
/// datagram.
pub struct DeflateCodec {
    body_length: usize,
    encoder: Compress,
    decoder: Decompress,
    encode_scratch: Vec<u8>,
    decode_scratch: Vec<u8>,
}

impl DeflateCodec {
    /// A codec for the given maximum body length.
    ///
    /// # Panics
    ///
    /// Panics if `body_length` is zero.
    #[must_use]
    pub fn new(body_length: usize) -> Self {
        assert!(body_length >= 1, "body_length must be positive");
        Self {
            body_length,
            encoder: Compress::new(Compression::default(), true),
            decoder: Decompress::new(true),
            encode_scratch: Vec::new(),
            decode_scratch: Vec::new(),
        }
    }

    fn max_compressed(&self) -> usize {
        deflate_bound(self.body_length)
    }

    fn peek_length(src: &[u8]) -> usize {
        u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
    }

    fn compress_body(&mut self, msg: &[u8]) -> Result<(), CodecError> {
        self.encoder.reset();
        self.encode_scratch.clear();
        self.encode_scratch.reserve(msg.len() / 2 + 64);

        let mut input = msg;
        loop {
            let in_before = self.encoder.total_in();
            let out_before = self.encoder.total_out();
            let status = self
                .encoder
                .compress_vec(input, &mut self.encode_scratch, FlushCompress::Finish)
                .map_err(|_| CodecError::InvalidEncoding("deflate compression failure"))?;
            let consumed = (self.encoder.total_in() - in_before) as usize;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if consumed == 0 && self.encoder.total_out() == out_before {
                        // Stalled with pending output space: the stream
                        // needs more room.
                        self.encode_scratch.reserve(64.max(self.encode_scratch.len()));
                    }
                }
            }
        }
    }

    fn decompress_body(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.decoder.reset(true);
        self.decode_scratch.clear();
        self.decode_scratch.reserve(self.body_length.min(4096).max(64));

        let mut input = data;
        loop {
            let in_before = self.decoder.total_in();
            let out_before = self.decoder.total_out();
            let status = self
                .decoder
                .decompress_vec(input, &mut self.decode_scratch, FlushDecompress::Finish)
                .map_err(|_| CodecError::InvalidEncoding("corrupt deflate stream"))?;
            let consumed = (self.decoder.total_in() - in_before) as usize;
            input = &input[consumed..];

            if self.decode_scratch.len() > self.body_length {
                return Err(CodecError::InvalidLength {
                    length: self.decode_scratch.len(),
                    limit: self.body_length,
                });
            }

            match status {
                Status::StreamEnd => {
                    if self.decode_scratch.is_empty() {
                        return Err(CodecError::InvalidEncoding("empty deflate stream"));
                    }
                    return Ok(());
                }
                Status::Ok | Status::BufError => {
                    let stalled = consumed == 0 && self.decoder.total_out() == out_before;
                    if stalled && input.is_empty() {
                        return Err(CodecError::InvalidEncoding("truncated deflate stream"));
                    }
                    if self.decode_scratch.len() == self.decode_scratch.capacity() {
                        let room = self.body_length + 1 - self.decode_scratch.len();
                        self.decode_scratch.reserve(room.min(4096).max(1));
                    }
                }
            }
        }
    }
}

impl MessageCodec for DeflateCodec {
    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        0
    }

    fn frame_length(&self) -> usize {
        HEADER_LENGTH + self.max_compressed()
    }

    fn encoded_length(&self, msg: &[u8]) -> usize {
        // Upper bound: the body is not compressed until `put`.
        HEADER_LENGTH + deflate_bound(msg.len())
    }

    fn put(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        self.is_valid(msg)?;
        self.compress_body(msg)?;
        dst.reserve(HEADER_LENGTH + self.encode_scratch.len());
        dst.put_u32(self.encode_scratch.len() as u32);
        dst.extend_from_slice(&self.encode_scratch);
        Ok(())
    }

    fn has_next(&mut self, src: &[u8]) -> Result<bool, CodecError> {
        if src.len() < HEADER_LENGTH {
            return Ok(false);
        }
        let length = Self::peek_length(src);
        if length < 1 || length > self.max_compressed() {
            return Err(CodecError::InvalidLength {
                length,
                limit: self.max_compressed(),
            });
        }
        Ok(src.len() >= HEADER_LENGTH + length)
    }

    fn decoded_length(&self, _src: &[u8]) -> usize {
        // The uncompressed size is only known after inflating; report
        // the ceiling the slot must accommodate.
        self.body_length
    }

    fn get(&mut self, src: &mut BytesMut, slot: &mut Payload) -> Result<(), CodecError> {
        assert!(src.len() >= HEADER_LENGTH, "get() without a complete frame");
        let length = src.get_u32() as usize;
        assert!(src.len() >= length, "get() without a complete frame");

        let result = self.decompress_body(&src[..length]);
        src.advance(length);
        result?;
        slot.set_from(&self.decode_scratch)?;
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn MessageCodec> {
        Box::new(Self::new(self.body_length))
    }
}

// ============================================================================
// LZ4
// ============================================================================

/// Frame encoding that compresses bodies with LZ4 block compression.
/// Bodies cannot be longer than 65252 bytes when frames must fit a UDP
/// datagram.
///
/// Wire layout: `[u32 payload][u32 raw_len][lz4 block]`, where `payload`
/// counts the `raw_len` field plus the block.
pub struct Lz4Codec {
    body_length: usize,
    encode_scratch: Vec<u8>,
}

const RAW_LEN_FIELD: usize = 4;

impl Lz4Codec {
    /// A codec for the given maximum body length.
    ///
    /// # Panics
    ///
    /// Panics if `body_length` is zero.
    #[must_use]
    pub fn new(body_length: usize) -> Self {
        assert!(body_length >= 1, "body_length must be positive");
        Self {
            body_length,
            encode_scratch: Vec::new(),
        }
    }

    fn max_payload(&self) -> usize {
        RAW_LEN_FIELD + block::get_maximum_output_size(self.body_length)
    }

    fn peek_length(src: &[u8]) -> usize {
        u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize
    }
}

impl MessageCodec for Lz4Codec {
    fn header_length(&self) -> usize {
        HEADER_LENGTH + RAW_LEN_FIELD
    }

    fn body_length(&self) -> usize {
        self.body_length
    }

    fn footer_length(&self) -> usize {
        0
    }

    fn frame_length(&self) -> usize {
        HEADER_LENGTH + self.max_payload()
    }

    fn encoded_length(&self, msg: &[u8]) -> usize {
        // Upper bound: the body is not compressed until `put`.
        HEADER_LENGTH + RAW_LEN_FIELD + block::get_maximum_output_size(msg.len())
    }

    fn put(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        self.is_valid(msg)?;
        self.encode_scratch
            .resize(block::get_maximum_output_size(msg.len()), 0);
        let written = block::compress_into(msg, &mut self.encode_scratch)
            .map_err(|_| CodecError::InvalidEncoding("lz4 compression failure"))?;

        dst.reserve(HEADER_LENGTH + RAW_LEN_FIELD + written);
        dst.put_u32((RAW_LEN_FIELD + written) as u32);
        dst.put_u32(msg.len() as u32);
        dst.extend_from_slice(&self.encode_scratch[..written]);
        Ok(())
    }

    fn has_next(&mut self, src: &[u8]) -> Result<bool, CodecError> {
        if src.len() < HEADER_LENGTH {
            return Ok(false);
        }
        let length = Self::peek_length(src);
        if length <= RAW_LEN_FIELD || length > self.max_payload() {
            return Err(CodecError::InvalidLength {
                length,
                limit: self.max_payload(),
            });
        }
        Ok(src.len() >= HEADER_LENGTH + length)
    }

    fn decoded_length(&self, src: &[u8]) -> usize {
        if src.len() < HEADER_LENGTH + RAW_LEN_FIELD {
            return 0;
        }
        u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize
    }

    fn get(&mut self, src: &mut BytesMut, slot: &mut Payload) -> Result<(), CodecError> {
        assert!(src.len() >= HEADER_LENGTH, "get() without a complete frame");
        let payload = src.get_u32() as usize;
        assert!(src.len() >= payload, "get() without a complete frame");

        let raw_len = src.get_u32() as usize;
        let block_len = payload - RAW_LEN_FIELD;
        if raw_len < 1 || raw_len > self.body_length {
            src.advance(block_len);
            return Err(CodecError::InvalidLength {
                length: raw_len,
                limit: self.body_length,
            });
        }

        let written = block::decompress_into(&src[..block_len], &mut slot.space()[..raw_len]);
        src.advance(block_len);
        match written {
            Ok(n) if n == raw_len => {
                slot.set_len(n);
                Ok(())
            }
            _ => {
                slot.clear();
                Err(CodecError::InvalidEncoding("corrupt lz4 block"))
            }
        }
    }

    fn clone_box(&self) -> Box<dyn MessageCodec> {
        Box::new(Self::new(self.body_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_shrinks_repetitive_bodies() {
        let mut codec = DeflateCodec::new(4096);
        let body = vec![0x41; 4096];
        let mut wire = BytesMut::new();
        codec.put(&body, &mut wire).unwrap();
        assert!(wire.len() < body.len() / 2);

        assert!(codec.has_next(&wire).unwrap());
        let mut slot = Payload::with_capacity(4096);
        codec.get(&mut wire, &mut slot).unwrap();
        assert_eq!(slot.as_slice(), &body[..]);
    }

    #[test]
    fn deflate_rejects_garbage() {
        let mut codec = DeflateCodec::new(4096);
        let mut wire = BytesMut::new();
        wire.put_u32(8);
        wire.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF]);

        assert!(codec.has_next(&wire).unwrap());
        let mut slot = Payload::with_capacity(4096);
        assert!(matches!(
            codec.get(&mut wire, &mut slot),
            Err(CodecError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn deflate_rejects_oversized_expansion() {
        // A frame produced for a larger body limit must not decode into
        // a channel configured with a smaller one.
        let mut wide = DeflateCodec::new(8192);
        let body = vec![0x42; 8192];
        let mut wire = BytesMut::new();
        wide.put(&body, &mut wire).unwrap();

        let mut narrow = DeflateCodec::new(1024);
        if narrow.has_next(&wire).unwrap() {
            let mut slot = Payload::with_capacity(8192);
            assert!(matches!(
                narrow.get(&mut wire, &mut slot),
                Err(CodecError::InvalidLength { .. })
            ));
        }
    }

    #[test]
    fn lz4_round_trip_incompressible() {
        let mut codec = Lz4Codec::new(1024);
        // Pseudo-random, incompressible body.
        let body: Vec<u8> = (0..1024u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let mut wire = BytesMut::new();
        codec.put(&body, &mut wire).unwrap();

        assert!(codec.has_next(&wire).unwrap());
        assert_eq!(codec.decoded_length(&wire), body.len());
        let mut slot = Payload::with_capacity(1024);
        codec.get(&mut wire, &mut slot).unwrap();
        assert_eq!(slot.as_slice(), &body[..]);
    }

    #[test]
    fn lz4_rejects_corrupt_block() {
        let mut codec = Lz4Codec::new(1024);
        let body = vec![0x33; 512];
        let mut wire = BytesMut::new();
        codec.put(&body, &mut wire).unwrap();

        // Corrupt a byte in the middle of the block.
        let mid = wire.len() / 2;
        wire[mid] ^= 0xFF;

        assert!(codec.has_next(&wire).unwrap());
        let mut slot = Payload::with_capacity(1024);
        assert!(codec.get(&mut wire, &mut slot).is_err());
    }
}
