//! Framing codecs.
//!
//! A codec turns message bodies into wire frames and back. Frames are
//! `[header][body][footer]`; the header carries the body length, the
//! footer (when present) a checksum. Decoding is a two-step protocol:
//! [`MessageCodec::has_next`] peeks at the accumulation buffer without
//! consuming anything, and [`MessageCodec::get`] extracts the frame only
//! after `has_next` returned `true`.
//!
//! Thread safety: one codec instance supports a concurrent encoder and
//! decoder (per-direction scratch is disjoint), but never two encoders
//! or two decoders. Channels clone a codec per direction via
//! [`MessageCodec::clone_box`], which sidesteps the question entirely.

use bytes::BytesMut;
use thiserror::Error;

use crate::payload::{Payload, SlotOverflow};

mod checksum;
mod compression;
mod int_header;
mod short_header;

pub use checksum::{ChecksumCodec, ChecksumKind};
pub use compression::{DeflateCodec, Lz4Codec};
pub use int_header::IntHeaderCodec;
pub use short_header::ShortHeaderCodec;

/// Largest payload of a single UDP datagram (65535 minus the 8-byte UDP
/// header).
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_527;

/// Frame validation and decoding failures.
///
/// Either kind terminates the channel that observed it; a length or
/// encoding error on a stream means the two ends no longer agree on
/// frame boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A length field (or a message offered for encoding) is outside the
    /// codec's declared bounds.
    #[error("invalid body length: {length} (limit {limit})")]
    InvalidLength { length: usize, limit: usize },

    /// Malformed frame content: checksum mismatch, undecodable
    /// compressed block, or a corrupt header.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(&'static str),
}

// A body that does not fit its slot is a length violation: slots are
// sized to the codec's body length.
impl From<SlotOverflow> for CodecError {
    fn from(err: SlotOverflow) -> Self {
        Self::InvalidLength {
            length: err.length,
            limit: err.capacity,
        }
    }
}

/// Message framing and delimitation.
pub trait MessageCodec: Send {
    /// Header length in bytes.
    fn header_length(&self) -> usize;

    /// Maximum body length in bytes.
    fn body_length(&self) -> usize;

    /// Footer length in bytes.
    fn footer_length(&self) -> usize;

    /// Maximum whole-frame length in bytes.
    fn frame_length(&self) -> usize {
        self.header_length() + self.body_length() + self.footer_length()
    }

    /// Length of `msg` after encoding.
    ///
    /// For compressing codecs this is an upper bound, used by the rate
    /// limiter before the frame is actually produced.
    fn encoded_length(&self, msg: &[u8]) -> usize;

    /// Check that `msg` fits in a frame: non-empty and at most
    /// [`body_length`](Self::body_length) bytes.
    fn is_valid(&self, msg: &[u8]) -> Result<(), CodecError> {
        let length = msg.len();
        if length < 1 || length > self.body_length() {
            return Err(CodecError::InvalidLength {
                length,
                limit: self.body_length(),
            });
        }
        Ok(())
    }

    /// Encode `msg` as one frame appended to `dst`.
    fn put(&mut self, msg: &[u8], dst: &mut BytesMut) -> Result<(), CodecError>;

    /// Whether `src` starts with one complete frame.
    ///
    /// Non-destructive: peeks at the header without consuming bytes.
    /// Errors if the header itself is invalid (the stream is beyond
    /// recovery at that point).
    fn has_next(&mut self, src: &[u8]) -> Result<bool, CodecError>;

    /// Decoded body length of the frame at the head of `src`.
    ///
    /// Only meaningful after [`has_next`](Self::has_next) returned
    /// `true`.
    fn decoded_length(&self, src: &[u8]) -> usize;

    /// Extract the frame at the head of `src` into `slot`, consuming it
    /// from `src`.
    ///
    /// # Panics
    ///
    /// Calling this without a preceding `has_next() == true` is a
    /// precondition violation and panics.
    fn get(&mut self, src: &mut BytesMut, slot: &mut Payload) -> Result<(), CodecError>;

    /// An independent instance with the same configuration, for the next
    /// channel (or the opposite direction of this one).
    fn clone_box(&self) -> Box<dyn MessageCodec>;
}

/// Short-header codec at its maximum body length (65525).
#[must_use]
pub fn short_max() -> ShortHeaderCodec {
    ShortHeaderCodec::max()
}

/// Short-header codec: two-byte length prefix, UDP-safe up to 65525.
#[must_use]
pub fn short(body_length: usize) -> ShortHeaderCodec {
    ShortHeaderCodec::new(body_length)
}

/// The default codec: four-byte length prefix, bodies up to `2^31 - 5`.
#[must_use]
pub fn default_codec(body_length: usize) -> IntHeaderCodec {
    IntHeaderCodec::new(body_length)
}

/// Int-header frame with a CRC32 footer over the body.
#[must_use]
pub fn crc32(body_length: usize) -> ChecksumCodec {
    ChecksumCodec::new(body_length, ChecksumKind::Crc32)
}

/// Int-header frame with an Adler-32 footer over the body.
#[must_use]
pub fn adler32(body_length: usize) -> ChecksumCodec {
    ChecksumCodec::new(body_length, ChecksumKind::Adler32)
}

/// Int-header frame with a 32-bit xxHash footer over the body.
#[must_use]
pub fn xxhash(body_length: usize) -> ChecksumCodec {
    ChecksumCodec::new(body_length, ChecksumKind::XxHash)
}

/// Int-header frame with a deflate-compressed body, UDP-safe up to
/// 65499.
#[must_use]
pub fn deflate(body_length: usize) -> DeflateCodec {
    DeflateCodec::new(body_length)
}

/// Int-header frame with an LZ4-compressed body, UDP-safe up to 65252.
#[must_use]
pub fn lz4(body_length: usize) -> Lz4Codec {
    Lz4Codec::new(body_length)
}
