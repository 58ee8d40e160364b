//! Application-facing channel handles.
//!
//! A `MessageChannel` is what the application holds: the producer end of
//! the output queue, the consumer end of the input queue, and the
//! lifecycle futures. The socket and processor live on an event-loop
//! thread; the handle only ever talks to them through tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use manifold_core::buffer::{MessageConsumer, MessageProducer};
use manifold_core::codec::CodecError;
use manifold_core::future::Completion;
use mio::Token;
use parking_lot::Mutex;

use crate::error::{Cause, ChannelError, ChannelFuture, Result};
use crate::pool::SelectorExecutor;

/// The read/write/merged lifecycle futures of one channel.
///
/// The driver completes the read and write halves; the merged future is
/// what the application observes.
pub(crate) struct ChannelFutures {
    pub connect: ChannelFuture,
    pub close_read: ChannelFuture,
    pub close_write: ChannelFuture,
    pub close: ChannelFuture,
}

impl ChannelFutures {
    pub fn new() -> Self {
        let close_read = ChannelFuture::new();
        let close_write = ChannelFuture::new();
        let close = Completion::merge(&[close_read.clone(), close_write.clone()]);
        Self {
            connect: ChannelFuture::new(),
            close_read,
            close_write,
            close,
        }
    }
}

/// One endpoint: a framed, buffered, rate-limited message stream.
///
/// Obtained from the channel builders. Send and receive go through the
/// message buffers; `send`/`recv` are convenience wrappers over them.
pub struct MessageChannel {
    executor: SelectorExecutor,
    token: Token,
    output: Option<Box<dyn MessageProducer>>,
    input: Option<Box<dyn MessageConsumer>>,
    connect_future: ChannelFuture,
    close_future: ChannelFuture,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    dropped: Option<Arc<AtomicU64>>,
}

impl MessageChannel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        executor: SelectorExecutor,
        token: Token,
        output: Box<dyn MessageProducer>,
        input: Option<Box<dyn MessageConsumer>>,
        connect_future: ChannelFuture,
        close_future: ChannelFuture,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        dropped: Option<Arc<AtomicU64>>,
    ) -> Self {
        Self {
            executor,
            token,
            output: Some(output),
            input,
            connect_future,
            close_future,
            local_addr,
            peer_addr,
            dropped,
        }
    }

    /// Completes once the channel is registered and connected (TLS
    /// channels: once the handshake finished).
    #[must_use]
    pub fn connect_future(&self) -> ChannelFuture {
        self.connect_future.clone()
    }

    /// Block until connected.
    pub fn wait_connected(&self) -> std::result::Result<(), Cause> {
        self.connect_future.wait()
    }

    /// Producer end of the output queue.
    ///
    /// # Panics
    ///
    /// Panics if the producer was moved out with
    /// [`take_output`](Self::take_output).
    pub fn output(&mut self) -> &mut dyn MessageProducer {
        self.output
            .as_deref_mut()
            .expect("output buffer was taken from this channel")
    }

    /// Consumer end of the input queue.
    ///
    /// # Panics
    ///
    /// Panics if the consumer was moved out with
    /// [`take_input`](Self::take_input), or if this channel was accepted
    /// into a shared (single) input buffer — read from the server
    /// channel in that mode.
    pub fn input(&mut self) -> &mut dyn MessageConsumer {
        self.input
            .as_deref_mut()
            .expect("input buffer is not attached to this channel")
    }

    /// Move the producer end out, e.g. onto a dedicated writer thread.
    pub fn take_output(&mut self) -> Option<Box<dyn MessageProducer>> {
        self.output.take()
    }

    /// Move the consumer end out, e.g. onto a dedicated reader thread.
    pub fn take_input(&mut self) -> Option<Box<dyn MessageConsumer>> {
        self.input.take()
    }

    /// Copy `msg` into the next output slot and publish it.
    ///
    /// Blocks while the output queue is full (backpressure).
    pub fn send(&mut self, msg: &[u8]) -> Result<()> {
        let output = self
            .output
            .as_deref_mut()
            .ok_or(ChannelError::Config("output buffer was taken"))?;
        let slot = output.claim()?;
        slot.set_from(msg).map_err(CodecError::from)?;
        output.publish();
        Ok(())
    }

    /// Block for the next inbound message and copy it out.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let input = self
            .input
            .as_deref_mut()
            .ok_or(ChannelError::Config("input buffer is not attached"))?;
        let slot = input.acquire()?;
        let msg = slot.as_slice().to_vec();
        input.release();
        Ok(msg)
    }

    /// Copy out the next inbound message if one is already published.
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>> {
        let input = self
            .input
            .as_deref_mut()
            .ok_or(ChannelError::Config("input buffer is not attached"))?;
        match input.try_acquire()? {
            Some(slot) => {
                let msg = slot.as_slice().to_vec();
                input.release();
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Initiate shutdown. Idempotent: the returned future is the same
    /// one every call observes, completed exactly once.
    pub fn close(&self) -> ChannelFuture {
        let token = self.token;
        self.executor
            .execute(Box::new(move |lp| lp.close(token, None)));
        self.close_future.clone()
    }

    /// Completes once the channel is fully shut down, carrying the
    /// failure cause if it did not close cleanly.
    #[must_use]
    pub fn close_future(&self) -> ChannelFuture {
        self.close_future.clone()
    }

    /// Run `listener` when the channel closes. Fires immediately if it
    /// already has.
    pub fn on_close(&self, listener: impl FnOnce(Option<&Cause>) + Send + 'static) {
        self.close_future
            .on_complete(move |result| listener(result.as_ref().err()));
    }

    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Datagram channels: how many inbound datagrams were dropped
    /// (undecodable, truncated, or arriving against a full queue).
    /// Always zero for stream channels.
    #[must_use]
    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped
            .as_ref()
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }
}

/// Listener invoked for every accepted connection.
pub(crate) type AcceptListener = Arc<dyn Fn(SocketAddr, MessageChannel) + Send + Sync>;

/// Listener invoked when an accepted channel closes.
pub(crate) type CloseListener = Arc<dyn Fn(SocketAddr, Option<Cause>) + Send + Sync>;

/// A bound server socket accepting framed channels.
pub struct ServerChannel {
    executor: SelectorExecutor,
    token: Token,
    bind_future: ChannelFuture,
    close_future: ChannelFuture,
    accept_slot: Arc<Mutex<Option<AcceptListener>>>,
    close_slot: Arc<Mutex<Option<CloseListener>>>,
    input: Option<Box<dyn MessageConsumer>>,
    local_addr: SocketAddr,
}

impl ServerChannel {
    pub(crate) fn new(
        executor: SelectorExecutor,
        token: Token,
        bind_future: ChannelFuture,
        close_future: ChannelFuture,
        accept_slot: Arc<Mutex<Option<AcceptListener>>>,
        close_slot: Arc<Mutex<Option<CloseListener>>>,
        input: Option<Box<dyn MessageConsumer>>,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            executor,
            token,
            bind_future,
            close_future,
            accept_slot,
            close_slot,
            input,
            local_addr,
        }
    }

    /// Completes once the listener is registered for accepts.
    #[must_use]
    pub fn bind_future(&self) -> ChannelFuture {
        self.bind_future.clone()
    }

    /// Invoke `listener` for every accepted connection, with the remote
    /// address and the new channel.
    pub fn on_accept(&self, listener: impl Fn(SocketAddr, MessageChannel) + Send + Sync + 'static) {
        *self.accept_slot.lock() = Some(Arc::new(listener));
    }

    /// Invoke `listener` whenever an accepted channel closes, with the
    /// remote address and the failure cause, if any.
    pub fn on_close(
        &self,
        listener: impl Fn(SocketAddr, Option<Cause>) + Send + Sync + 'static,
    ) {
        *self.close_slot.lock() = Some(Arc::new(listener));
    }

    /// The shared input buffer, in single-input-buffer mode: every
    /// accepted channel publishes into this one queue.
    pub fn input(&mut self) -> Option<&mut dyn MessageConsumer> {
        match &mut self.input {
            Some(b) => Some(b.as_mut()),
            None => None,
        }
    }

    /// Move the shared input consumer out, e.g. onto a worker thread.
    pub fn take_input(&mut self) -> Option<Box<dyn MessageConsumer>> {
        self.input.take()
    }

    /// Stop accepting. Channels already accepted keep running.
    pub fn close(&self) -> ChannelFuture {
        let token = self.token;
        self.executor
            .execute(Box::new(move |lp| lp.close(token, None)));
        self.close_future.clone()
    }

    /// Completes once the listener socket is released.
    #[must_use]
    pub fn close_future(&self) -> ChannelFuture {
        self.close_future.clone()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
