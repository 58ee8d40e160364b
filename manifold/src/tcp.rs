//! TCP channel driver.
//!
//! Shuttles bytes between one connected TCP socket and the codec/queue
//! layer. The read path accumulates socket bytes in `in_buf` and frames
//! them into the input queue; the write path encodes from the output
//! queue into `out_buf` under the rate limiter and flushes. Queue-full
//! and rate-limit conditions pause the respective direction; the queue
//! wakeups and the loop timer re-arm it.
//!
//! Readiness is edge-style: pausing a direction is a flag here, not a
//! selector mutation, and re-arming pumps immediately rather than
//! waiting for an edge that may never come.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::Buf;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::channel::ChannelFutures;
use crate::error::{cause_from, Cause, ChannelError, ChannelFuture};
use crate::monitor::{emit, SocketEvent, SocketEventSender};
use crate::pool::{Drive, Driver, LoopCtx};
use crate::processor::{DecodeState, EncodeState, ProcessorCore};

pub(crate) struct TcpDriver {
    stream: TcpStream,
    token: Token,
    core: ProcessorCore,
    want_read: bool,
    want_write: bool,
    connected: bool,
    peer: SocketAddr,
    connect_future: ChannelFuture,
    close_read: ChannelFuture,
    close_write: ChannelFuture,
    monitor: Option<SocketEventSender>,
    shut: bool,
}

impl TcpDriver {
    /// Driver for an outbound, still-connecting socket.
    pub fn connecting(
        stream: TcpStream,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self::new(stream, token, core, peer, false, futures, monitor)
    }

    /// Driver for a socket that arrived established via accept.
    pub fn accepted(
        stream: TcpStream,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self::new(stream, token, core, peer, true, futures, monitor)
    }

    fn new(
        stream: TcpStream,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        connected: bool,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            stream,
            token,
            core,
            want_read: true,
            want_write: true,
            connected,
            peer,
            connect_future: futures.connect.clone(),
            close_read: futures.close_read.clone(),
            close_write: futures.close_write.clone(),
            monitor,
            shut: false,
        }
    }

    fn pump_read(&mut self) -> Drive {
        loop {
            // Frame whatever is already buffered before touching the
            // socket again; backpressure must stop the reads, not just
            // the decodes.
            match self.core.decode_frames() {
                Err(err) => {
                    debug!(peer = %self.peer, %err, "decode failed; closing channel");
                    return Drive::Close(Some(cause_from(err.into())));
                }
                Ok(DecodeState::Backpressured) => {
                    trace!(peer = %self.peer, "input queue full; read paused");
                    self.want_read = false;
                    return Drive::Continue;
                }
                Ok(DecodeState::QueueDown) => return Drive::Close(None),
                Ok(DecodeState::Drained) => {}
            }

            match self.stream.read(&mut self.core.scratch) {
                Ok(0) => {
                    trace!(peer = %self.peer, "peer closed");
                    return Drive::Close(None);
                }
                Ok(n) => {
                    self.core.in_buf.extend_from_slice(&self.core.scratch[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drive::Continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Drive::Close(Some(cause_from(err.into()))),
            }
        }
    }

    fn pump_write(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        if !self.connected {
            return Drive::Continue;
        }
        loop {
            while !self.core.out_buf.is_empty() {
                match self.stream.write(&self.core.out_buf) {
                    Ok(0) => {
                        return Drive::Close(Some(cause_from(
                            io::Error::from(io::ErrorKind::WriteZero).into(),
                        )))
                    }
                    Ok(n) => self.core.out_buf.advance(n),
                    // Socket buffer full: the next writable edge resumes.
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drive::Continue,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Drive::Close(Some(cause_from(err.into()))),
                }
            }

            match self.core.next_frame() {
                Err(err) => return Drive::Close(Some(cause_from(err.into()))),
                Ok(EncodeState::Filled) => {}
                Ok(EncodeState::Empty) | Ok(EncodeState::QueueDown) => {
                    self.want_write = false;
                    return Drive::Continue;
                }
                Ok(EncodeState::Limited(wait)) => {
                    trace!(peer = %self.peer, ?wait, "rate limited; write deferred");
                    self.want_write = false;
                    ctx.arm_timer(wait);
                    return Drive::Continue;
                }
            }
        }
    }

    /// Try to complete the non-blocking connect on the first writable
    /// event. Returns `Some` when the channel must close instead.
    fn finish_connect(&mut self) -> Option<Drive> {
        match self.stream.take_error() {
            Ok(None) => {
                self.connected = true;
                self.connect_future.succeed(());
                emit(&self.monitor, SocketEvent::Connected(self.peer));
                debug!(peer = %self.peer, "connected");
                None
            }
            Ok(Some(err)) | Err(err) => {
                debug!(peer = %self.peer, %err, "connect failed");
                Some(Drive::Close(Some(cause_from(err.into()))))
            }
        }
    }
}

impl Driver for TcpDriver {
    fn install(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        if self.connected {
            self.connect_future.succeed(());
        }
        Ok(())
    }

    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, writable: bool) -> Drive {
        let mut just_connected = false;
        if writable && !self.connected {
            if let Some(close) = self.finish_connect() {
                return close;
            }
            just_connected = true;
        }

        if readable && self.want_read {
            if let Drive::Close(cause) = self.pump_read() {
                return Drive::Close(cause);
            }
        }
        if (writable || just_connected) && self.want_write {
            if let Drive::Close(cause) = self.pump_write(ctx) {
                return Drive::Close(cause);
            }
        }
        Drive::Continue
    }

    fn timer(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        self.want_write = true;
        self.pump_write(ctx)
    }

    fn wake_write(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        self.want_write = true;
        self.pump_write(ctx)
    }

    fn wake_read(&mut self, _ctx: &mut LoopCtx<'_>) -> Drive {
        self.want_read = true;
        self.pump_read()
    }

    fn shutdown(&mut self, registry: &Registry, cause: Option<Cause>) {
        if self.shut {
            return;
        }
        self.shut = true;

        // Best-effort flush of already-encoded frames.
        if !self.core.out_buf.is_empty() {
            if let Ok(n) = self.stream.write(&self.core.out_buf) {
                self.core.out_buf.advance(n);
            }
        }

        let _ = registry.deregister(&mut self.stream);
        self.core.close_queues();

        if !self.connect_future.is_done() {
            self.connect_future.fail(
                cause
                    .clone()
                    .unwrap_or_else(|| cause_from(ChannelError::Closed)),
            );
        }
        match &cause {
            Some(cause) => {
                warn!(peer = %self.peer, %cause, "channel closed");
                self.close_read.fail(cause.clone());
                self.close_write.fail(cause.clone());
            }
            None => {
                debug!(peer = %self.peer, "channel closed");
                self.close_read.succeed(());
                self.close_write.succeed(());
            }
        }
        emit(
            &self.monitor,
            SocketEvent::Closed {
                peer: Some(self.peer),
                cause,
            },
        );
    }
}
