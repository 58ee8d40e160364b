//! Shared processor state.
//!
//! Every stream or datagram driver owns a `ProcessorCore`: the codec,
//! the rate limiter, the channel-side endpoints of the two message
//! buffers, and the reusable wire-side buffers. The pump helpers here
//! implement the queue/codec halves of the read and write paths; the
//! drivers wrap them with the actual socket I/O.

use bytes::BytesMut;
use manifold_core::buffer::{MessageConsumer, MessageProducer};
use manifold_core::codec::{CodecError, MessageCodec};
use manifold_core::limit::{Grant, RateLimiter};
use std::time::Duration;

/// Outcome of draining decodable frames out of `in_buf`.
pub(crate) enum DecodeState {
    /// No complete frame left; keep reading from the socket.
    Drained,
    /// The input queue is full; reading must pause until the consumer
    /// releases a slot.
    Backpressured,
    /// The input queue was closed underneath us; the channel is going
    /// away.
    QueueDown,
}

/// Outcome of trying to encode the next pending message into `out_buf`.
pub(crate) enum EncodeState {
    /// A frame was encoded; flush it.
    Filled,
    /// Nothing pending; the write side can go idle.
    Empty,
    /// The rate limiter denied the send; retry after the wait.
    Limited(Duration),
    /// The output queue was closed underneath us.
    QueueDown,
}

pub(crate) struct ProcessorCore {
    pub codec: Box<dyn MessageCodec>,
    pub limiter: Box<dyn RateLimiter>,
    /// Consumer end of the application's output queue (send path).
    pub chn_in: Box<dyn MessageConsumer>,
    /// Producer end of the application's input queue (receive path).
    pub chn_out: Box<dyn MessageProducer>,
    /// Bytes read off the socket, not yet framed.
    pub in_buf: BytesMut,
    /// Encoded frames not yet written to the socket.
    pub out_buf: BytesMut,
    /// Reusable read scratch, sized to the receive buffer.
    pub scratch: Box<[u8]>,
}

impl ProcessorCore {
    pub fn new(
        codec: Box<dyn MessageCodec>,
        limiter: Box<dyn RateLimiter>,
        chn_in: Box<dyn MessageConsumer>,
        chn_out: Box<dyn MessageProducer>,
        scratch_size: usize,
    ) -> Self {
        let frame = codec.frame_length().min(64 * 1024);
        Self {
            codec,
            limiter,
            chn_in,
            chn_out,
            in_buf: BytesMut::with_capacity(frame * 2),
            out_buf: BytesMut::with_capacity(frame * 2),
            scratch: vec![0u8; scratch_size.max(4096)].into_boxed_slice(),
        }
    }

    /// Move every complete frame in `in_buf` into the input queue.
    pub fn decode_frames(&mut self) -> Result<DecodeState, CodecError> {
        loop {
            if !self.codec.has_next(&self.in_buf)? {
                return Ok(DecodeState::Drained);
            }
            match self.chn_out.try_claim() {
                Ok(Some(slot)) => {
                    self.codec.get(&mut self.in_buf, slot)?;
                    self.chn_out.publish();
                }
                Ok(None) => return Ok(DecodeState::Backpressured),
                Err(_) => return Ok(DecodeState::QueueDown),
            }
        }
    }

    /// Encode the next pending message, if the limiter admits it.
    ///
    /// The message stays acquired (and uncharged) when the limiter says
    /// wait, so the retry sees it again.
    pub fn next_frame(&mut self) -> Result<EncodeState, CodecError> {
        if !self.out_buf.is_empty() {
            return Ok(EncodeState::Filled);
        }
        let msg = match self.chn_in.try_acquire() {
            Ok(Some(msg)) => msg,
            Ok(None) => return Ok(EncodeState::Empty),
            Err(_) => return Ok(EncodeState::QueueDown),
        };
        let need = self.codec.encoded_length(msg.as_slice());
        match self.limiter.acquire(need) {
            Grant::Wait(wait) => Ok(EncodeState::Limited(wait)),
            Grant::Granted => {
                self.codec.put(msg.as_slice(), &mut self.out_buf)?;
                self.chn_in.release();
                Ok(EncodeState::Filled)
            }
        }
    }

    /// Close both queues so blocked application threads observe the
    /// channel going away.
    pub fn close_queues(&self) {
        self.chn_in.close();
        self.chn_out.close();
    }
}
