//! UDP channel driver.
//!
//! Datagram-oriented counterpart of the stream drivers: every datagram
//! is decoded in one pass, every message goes out as exactly one
//! datagram. There is no cross-datagram ordering and no backpressure on
//! the receive side — an undecodable, truncated, or unqueueable datagram
//! is dropped and counted.
//!
//! Readiness under mio is edge-style, so each event drains the socket;
//! the one-pass-per-datagram decode contract is unaffected.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace, warn};

use crate::channel::ChannelFutures;
use crate::error::{cause_from, Cause, ChannelError, ChannelFuture};
use crate::monitor::{emit, SocketEvent, SocketEventSender};
use crate::pool::{Drive, Driver, LoopCtx};
use crate::processor::ProcessorCore;
use manifold_core::limit::Grant;

pub(crate) struct UdpDriver {
    socket: UdpSocket,
    token: Token,
    core: ProcessorCore,
    want_write: bool,
    /// Whether the socket has a fixed peer (send requires it).
    connected: bool,
    /// Scratch for one inbound datagram's framing pass.
    dgram_buf: BytesMut,
    /// The encoded-but-unsent datagram in `out_buf` still owns its
    /// message slot; release happens after the send.
    send_pending: bool,
    dropped: Arc<AtomicU64>,
    peer: Option<SocketAddr>,
    connect_future: ChannelFuture,
    close_read: ChannelFuture,
    close_write: ChannelFuture,
    monitor: Option<SocketEventSender>,
    shut: bool,
}

impl UdpDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: UdpSocket,
        token: Token,
        core: ProcessorCore,
        peer: Option<SocketAddr>,
        dropped: Arc<AtomicU64>,
        futures: &ChannelFutures,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            socket,
            token,
            core,
            want_write: true,
            connected: peer.is_some(),
            dgram_buf: BytesMut::new(),
            send_pending: false,
            dropped,
            peer,
            connect_future: futures.connect.clone(),
            close_read: futures.close_read.clone(),
            close_write: futures.close_write.clone(),
            monitor,
            shut: false,
        }
    }

    fn drop_datagram(&self, reason: &str, from: SocketAddr) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(%from, reason, "datagram dropped");
    }

    /// One decode pass over one datagram. Anything that does not yield
    /// exactly one whole frame drops the datagram.
    fn ingest(&mut self, len: usize, from: SocketAddr) {
        self.dgram_buf.clear();
        self.dgram_buf.extend_from_slice(&self.core.scratch[..len]);

        match self.core.codec.has_next(&self.dgram_buf) {
            Ok(true) => {}
            Ok(false) => return self.drop_datagram("truncated frame", from),
            Err(_) => return self.drop_datagram("invalid frame", from),
        }
        match self.core.chn_out.try_claim() {
            Ok(Some(slot)) => {
                match self.core.codec.get(&mut self.dgram_buf, slot) {
                    Ok(()) => self.core.chn_out.publish(),
                    Err(_) => self.drop_datagram("undecodable frame", from),
                }
            }
            Ok(None) => self.drop_datagram("input queue full", from),
            Err(_) => {}
        }
    }

    fn pump_read(&mut self) -> Drive {
        loop {
            match self.socket.recv_from(&mut self.core.scratch) {
                Ok((len, from)) => self.ingest(len, from),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drive::Continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // ICMP unreachable surfacing through a connected socket
                // is not fatal for a datagram channel.
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                    trace!(%err, "peer unreachable");
                }
                Err(err) => return Drive::Close(Some(cause_from(err.into()))),
            }
        }
    }

    fn pump_write(&mut self, ctx: &mut LoopCtx<'_>) -> Drive {
        loop {
            if self.send_pending {
                match self.socket.send(&self.core.out_buf) {
                    Ok(_) => {
                        self.core.out_buf.clear();
                        self.send_pending = false;
                        self.core.chn_in.release();
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drive::Continue,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                        // Datagram lost to an unreachable peer; move on.
                        trace!(%err, "send to unreachable peer");
                        self.core.out_buf.clear();
                        self.send_pending = false;
                        self.core.chn_in.release();
                    }
                    Err(err) => return Drive::Close(Some(cause_from(err.into()))),
                }
                continue;
            }

            let msg = match self.core.chn_in.try_acquire() {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => {
                    self.want_write = false;
                    return Drive::Continue;
                }
            };
            if !self.connected {
                debug!("message on an unconnected datagram channel discarded");
                self.core.chn_in.release();
                continue;
            }
            let need = self.core.codec.encoded_length(msg.as_slice());
            match self.core.limiter.acquire(need) {
                Grant::Wait(wait) => {
                    trace!(?wait, "rate limited; send deferred");
                    self.want_write = false;
                    ctx.arm_timer(wait);
                    return Drive::Continue;
                }
                Grant::Granted => {
                    if let Err(err) = self.core.codec.put(msg.as_slice(), &mut self.core.out_buf) {
                        return Drive::Close(Some(cause_from(err.into())));
                    }
                    self.send_pending = true;
                }
            }
        }
    }
}

impl Driver for UdpDriver {
    fn install(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            &mut self.socket,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.connect_future.succeed(());
        if let Some(peer) = self.peer {
            emit(&self.monitor, SocketEvent::Connected(peer));
        }
        Ok(())
    }

    fn ready(&mut self, ctx: &mut LoopCtx<'_>, readable: bool, writable: bool) -> Drive {
        if readable {
            if let Drive::Close(cause) = self.pump_read() {
                return Drive::Close(cause);
            }
        }
        if writable && self.want_write {
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
        // Datagram channels never pause reads; drops already happened.
        Drive::Continue
    }

    fn shutdown(&mut self, registry: &Registry, cause: Option<Cause>) {
        if self.shut {
            return;
        }
        self.shut = true;

        let _ = registry.deregister(&mut self.socket);
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
                warn!(peer = ?self.peer, %cause, "channel closed");
                self.close_read.fail(cause.clone());
                self.close_write.fail(cause.clone());
            }
            None => {
                debug!(peer = ?self.peer, "channel closed");
                self.close_read.succeed(());
                self.close_write.succeed(());
            }
        }
        emit(
            &self.monitor,
            SocketEvent::Closed {
                peer: self.peer,
                cause,
            },
        );
    }
}
