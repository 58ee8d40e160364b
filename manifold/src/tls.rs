//! TLS channel driver.
//!
//! The TCP driver's contract with a rustls session interposed. The
//! session owns the ciphertext staging (netIn/netOut); `in_buf` and
//! `out_buf` hold plaintext on the application side of the engine.
//!
//! Handshake driving maps onto the unbuffered rustls API: ciphertext in
//! via `read_tls` + `process_new_packets`, ciphertext out while
//! `wants_write`, and the `is_handshaking` true-to-false edge is the
//! finished transition that completes the connect future. Key updates
//! mid-stream are absorbed by `process_new_packets` without pausing the
//! caller. Close sends a close-notify and flushes it best-effort; an
//! unacknowledged close-notify is logged, never waited on.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use bytes::Buf;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::Connection;
use tracing::{debug, trace, warn};

use crate::channel::ChannelFutures;
use crate::error::{cause_from, Cause, ChannelError, ChannelFuture};
use crate::monitor::{emit, SocketEvent, SocketEventSender};
use crate::pool::{Drive, Driver, LoopCtx};
use crate::processor::{DecodeState, EncodeState, ProcessorCore};

pub(crate) struct TlsDriver {
    stream: TcpStream,
    session: Connection,
    token: Token,
    core: ProcessorCore,
    want_read: bool,
    want_write: bool,
    /// TCP-level establishment (outbound sockets start false).
    connected: bool,
    handshaking: bool,
    peer_closed: bool,
    sent_close_notify: bool,
    peer: SocketAddr,
    connect_future: ChannelFuture,
    close_read: ChannelFuture,
    close_write: ChannelFuture,
    monitor: Option<SocketEventSender>,
    shut: bool,
}

impl TlsDriver {
    /// Outbound channel: TCP connect still in flight, client handshake
    /// queued inside the session.
    pub fn connecting(
        stream: TcpStream,
        session: Connection,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self::new(stream, session, token, core, peer, false, futures, monitor)
    }

    /// Accepted channel: TCP established, server handshake pending.
    pub fn accepted(
        stream: TcpStream,
        session: Connection,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self::new(stream, session, token, core, peer, true, futures, monitor)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        stream: TcpStream,
        session: Connection,
        token: Token,
        core: ProcessorCore,
        peer: SocketAddr,
        connected: bool,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            stream,
            session,
            token,
            core,
            want_read: true,
            want_write: true,
            connected,
            handshaking: true,
            peer_closed: false,
            sent_close_notify: false,
            peer,
            connect_future: futures.connect.clone(),
            close_read: futures.close_read.clone(),
            close_write: futures.close_write.clone(),
            monitor,
            shut: false,
        }
    }

    /// Note the handshake finishing and complete the connect future.
    fn check_handshake_edge(&mut self) {
        if self.handshaking && !self.session.is_handshaking() {
            self.handshaking = false;
            self.connect_future.succeed(());
            emit(&self.monitor, SocketEvent::Connected(self.peer));
            debug!(peer = %self.peer, "TLS handshake completed");
        }
    }

    /// Drain decrypted plaintext out of the session into `in_buf`.
    fn drain_plaintext(&mut self) -> io::Result<()> {
        loop {
            match self.session.reader().read(&mut self.core.scratch) {
                // Clean plaintext EOF: the peer's close-notify arrived.
                Ok(0) => {
                    self.peer_closed = true;
                    return Ok(());
                }
                Ok(n) => self.core.in_buf.extend_from_slice(&self.core.scratch[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn pump_read(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        loop {
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
            if self.peer_closed {
                trace!(peer = %self.peer, "close-notify received");
                return Drive::Close(None);
            }

            match self.session.read_tls(&mut self.stream) {
                Ok(0) => {
                    // TCP EOF. With a prior close-notify this is the
                    // normal tail of a clean closure.
                    return Drive::Close(None);
                }
                Ok(_) => {
                    let state = match self.session.process_new_packets() {
                        Ok(state) => state,
                        Err(err) => {
                            // Push out the alert rustls queued before the
                            // socket goes away.
                            let _ = self.session.write_tls(&mut self.stream);
                            debug!(peer = %self.peer, %err, "TLS engine failure");
                            return Drive::Close(Some(cause_from(err.into())));
                        }
                    };
                    if state.plaintext_bytes_to_read() > 0 || state.peer_has_closed() {
                        if let Err(err) = self.drain_plaintext() {
                            return Drive::Close(Some(cause_from(err.into())));
                        }
                    }
                    self.check_handshake_edge();
                    if self.session.wants_write() {
                        if let Drive::Close(cause) = self.flush_tls() {
                            return Drive::Close(cause);
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Nothing more on the wire; resume the write side if
                    // the handshake just freed it.
                    if !self.handshaking && self.want_write {
                        return self.pump_write(ctx);
                    }
                    return Drive::Continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Drive::Close(Some(cause_from(err.into()))),
            }
        }
    }

    /// Write queued ciphertext to the socket.
    fn flush_tls(&mut self) -> Drive {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Next writable edge continues the flush.
                    self.want_write = true;
                    return Drive::Continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Drive::Close(Some(cause_from(err.into()))),
            }
        }
        Drive::Continue
    }

    fn pump_write(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        if !self.connected {
            return Drive::Continue;
        }
        loop {
            if let Drive::Close(cause) = self.flush_tls() {
                return Drive::Close(cause);
            }
            if self.session.wants_write() {
                // Socket full mid-flush; flush_tls re-armed the writer.
                return Drive::Continue;
            }
            if self.handshaking {
                // Application data waits for the finished transition.
                return Drive::Continue;
            }

            if !self.core.out_buf.is_empty() {
                match self.session.writer().write(&self.core.out_buf) {
                    Ok(0) => return Drive::Continue,
                    Ok(n) => {
                        self.core.out_buf.advance(n);
                        continue;
                    }
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

    fn finish_connect(&mut self) -> Option<Drive> {
        match self.stream.take_error() {
            Ok(None) => {
                self.connected = true;
                debug!(peer = %self.peer, "TCP established; handshake in flight");
                None
            }
            Ok(Some(err)) | Err(err) => {
                debug!(peer = %self.peer, %err, "connect failed");
                Some(Drive::Close(Some(cause_from(err.into()))))
            }
        }
    }
}

impl Driver for TlsDriver {
    fn install(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut self.stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )
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
            if let Drive::Close(cause) = self.pump_read(ctx) {
                return Drive::Close(cause);
            }
        }
        if (writable || just_connected) && (self.want_write || self.session.wants_write()) {
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

    fn wake_read(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        self.want_read = true;
        self.pump_read(ctx)
    }

    fn shutdown(&mut self, registry: &Registry, cause: Option<Cause>) {
        if self.shut {
            return;
        }
        self.shut = true;

        // Clean closure: queue the close-notify and push it out along
        // with any residual ciphertext. Best-effort only; the socket is
        // released regardless.
        if cause.is_none() && self.connected && !self.sent_close_notify {
            self.session.send_close_notify();
            self.sent_close_notify = true;
        }
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(err) => {
                    warn!(peer = %self.peer, %err, "close-notify not fully flushed");
                    break;
                }
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
