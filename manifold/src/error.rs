//! Channel error types.

use std::io;
use std::sync::Arc;

use manifold_core::buffer::QueueClosed;
use manifold_core::codec::CodecError;
use manifold_core::future::Completion;
use thiserror::Error;

/// Main error type for channel operations.
///
/// A `ChannelError` is also the failure cause a channel's close future
/// carries: whatever terminated the channel is what close listeners and
/// waiters observe.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// I/O error during socket operations. `WouldBlock` never surfaces
    /// here; it is absorbed by interest toggling.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Frame validation or decoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// TLS engine failure during handshake, rekey, or data transfer.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The channel (or one of its message buffers) is closed.
    #[error("channel closed")]
    Closed,

    /// The selector pool terminated before the operation completed.
    #[error("selector pool terminated")]
    PoolTerminated,

    /// A builder was asked to open a channel without a mandatory option.
    #[error("channel misconfigured: {0}")]
    Config(&'static str),
}

impl From<QueueClosed> for ChannelError {
    fn from(_: QueueClosed) -> Self {
        Self::Closed
    }
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Shared failure cause, as carried by completions across threads.
pub type Cause = Arc<ChannelError>;

/// Lifecycle future of a channel: connect, bind, and close all resolve
/// to `()` or to the cause that ended them.
pub type ChannelFuture = Completion<(), Cause>;

pub(crate) fn cause_from(err: ChannelError) -> Cause {
    Arc::new(err)
}
