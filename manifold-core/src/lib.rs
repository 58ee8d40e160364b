//! Manifold Core
//!
//! This crate contains the runtime-agnostic core building blocks:
//! - Reusable fixed-capacity payload slots (`payload`)
//! - Bounded message buffers with ring and blocking variants (`buffer`)
//! - Framing codecs: short-header, int-header, checksum, compression (`codec`)
//! - Token-bucket rate limiting (`limit`)
//! - One-shot settable and merging completions (`future`)
//!
//! Nothing in here touches a socket. The selector runtime lives in the
//! `manifold` crate and composes these pieces per channel.

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod buffer;
pub mod codec;
pub mod future;
pub mod limit;
pub mod payload;

// Small prelude for downstream crates. Kept minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::buffer::{MessageConsumer, MessageProducer, QueueClosed};
    pub use crate::codec::{CodecError, MessageCodec};
    pub use crate::future::Completion;
    pub use crate::limit::{Grant, RateLimiter, RateUnit};
    pub use crate::payload::{Payload, SlotOverflow};
}
