//! Server acceptor.
//!
//! A driver for the listening socket: accepts until the socket would
//! block, builds a fresh processor and buffer set per connection (or
//! attaches the shared input queue in fan-in mode), and hands the new
//! channel to the pool's next event loop. The accept listener fires off
//! the child's connect future, so TLS channels surface only after their
//! handshake finished.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use manifold_core::buffer::MessageProducer;
use manifold_core::codec::MessageCodec;
use manifold_core::limit::RateLimiter;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use rustls::ServerConnection;
use tracing::{debug, trace, warn};

use crate::builder::{make_queue, QueueKind};
use crate::channel::{AcceptListener, ChannelFutures, CloseListener, MessageChannel};
use crate::error::{cause_from, Cause, ChannelError, ChannelFuture};
use crate::monitor::{emit, SocketEvent, SocketEventSender};
use crate::net::configure_buffers;
use crate::pool::{read_wakeup, write_wakeup, Drive, Driver, LoopCtx, SelectorPool};
use crate::processor::ProcessorCore;
use crate::tcp::TcpDriver;
use crate::tls::TlsDriver;

/// Everything needed to outfit one accepted connection.
pub(crate) struct ChildConfig {
    pub pool: SelectorPool,
    pub capacity: usize,
    pub queue: QueueKind,
    pub send_buffer: usize,
    pub recv_buffer: usize,
    pub codec: Box<dyn MessageCodec>,
    pub limiter: Box<dyn RateLimiter>,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub monitor: Option<SocketEventSender>,
}

pub(crate) struct AcceptorDriver {
    listener: TcpListener,
    token: Token,
    config: ChildConfig,
    /// Producer prototype for the shared input queue (fan-in mode).
    shared_input: Option<Box<dyn MessageProducer>>,
    accept_slot: Arc<Mutex<Option<AcceptListener>>>,
    close_slot: Arc<Mutex<Option<CloseListener>>>,
    bind_future: ChannelFuture,
    close_future: ChannelFuture,
    local_addr: SocketAddr,
    shut: bool,
}

impl AcceptorDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        token: Token,
        config: ChildConfig,
        shared_input: Option<Box<dyn MessageProducer>>,
        accept_slot: Arc<Mutex<Option<AcceptListener>>>,
        close_slot: Arc<Mutex<Option<CloseListener>>>,
        bind_future: ChannelFuture,
        close_future: ChannelFuture,
        local_addr: SocketAddr,
    ) -> Self {
        Self {
            listener,
            token,
            config,
            shared_input,
            accept_slot,
            close_slot,
            bind_future,
            close_future,
            local_addr,
            shut: false,
        }
    }

    fn accept_one(&mut self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        configure_buffers(&stream, self.config.send_buffer, self.config.recv_buffer);

        let slot_size = self.config.codec.body_length();
        let (app_out, chn_in) = make_queue(self.config.queue, self.config.capacity, slot_size);
        let (chn_out, app_in) = match &self.shared_input {
            Some(prototype) => (prototype.clone_producer(), None),
            None => {
                let (producer, consumer) = make_queue(
                    self.config.queue,
                    self.config.capacity,
                    slot_size,
                );
                (producer, Some(consumer))
            }
        };

        let futures = ChannelFutures::new();
        let token = self.config.pool.token();
        let executor = self.config.pool.next();

        let mut chn_in = chn_in;
        let mut chn_out = chn_out;
        chn_in.attach_wakeup(write_wakeup(&executor, token));
        chn_out.attach_wakeup(read_wakeup(&executor, token));

        let core = ProcessorCore::new(
            self.config.codec.clone_box(),
            self.config.limiter.clone_box(),
            chn_in,
            chn_out,
            self.config.recv_buffer,
        );

        let driver: Box<dyn Driver> = match &self.config.tls {
            Some(tls_config) => {
                let session = match ServerConnection::new(Arc::clone(tls_config)) {
                    Ok(session) => session,
                    Err(err) => {
                        warn!(%peer, %err, "TLS session creation failed; connection dropped");
                        return;
                    }
                };
                Box::new(TlsDriver::accepted(
                    stream,
                    rustls::Connection::Server(session),
                    token,
                    core,
                    peer,
                    &futures,
                    self.config.monitor.clone(),
                ))
            }
            None => Box::new(TcpDriver::accepted(
                stream,
                token,
                core,
                peer,
                &futures,
                self.config.monitor.clone(),
            )),
        };

        let channel = MessageChannel::new(
            executor.clone(),
            token,
            app_out,
            app_in,
            futures.connect.clone(),
            futures.close.clone(),
            Some(self.local_addr),
            Some(peer),
            None,
        );

        // The accept listener sees the channel only once its connect
        // future succeeded; a failed registration or handshake closes
        // the orphan instead.
        let accept_slot = Arc::clone(&self.accept_slot);
        futures.connect.on_complete(move |result| {
            if result.is_ok() {
                let listener = accept_slot.lock().clone();
                if let Some(listener) = listener {
                    listener(peer, channel);
                }
            }
        });

        let close_slot = Arc::clone(&self.close_slot);
        futures.close.on_complete(move |result| {
            let listener = close_slot.lock().clone();
            if let Some(listener) = listener {
                listener(peer, result.as_ref().err().cloned());
            }
        });

        emit(&self.config.monitor, SocketEvent::Accepted(peer));
        trace!(%peer, "connection accepted");
        executor.execute(Box::new(move |lp| lp.install(token, driver)));
    }
}

impl Driver for AcceptorDriver {
    fn install(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.listener, self.token, Interest::READABLE)?;
        self.bind_future.succeed(());
        emit(&self.config.monitor, SocketEvent::Bound(self.local_addr));
        debug!(addr = %self.local_addr, "listening");
        Ok(())
    }

    fn ready(&mut self, _ctx: &mut LoopCtx<'_>, readable: bool, _writable: bool) -> Drive {
        if !readable {
            return Drive::Continue;
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Drive::Continue,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(%err, "transient accept error");
                }
                Err(err) => {
                    warn!(%err, "acceptor failed");
                    return Drive::Close(Some(cause_from(err.into())));
                }
            }
        }
    }

    fn timer(&mut self, _ctx: &mut LoopCtx<'_>) -> Drive {
        Drive::Continue
    }

    fn wake_write(&mut self, _ctx: &mut LoopCtx<'_>) -> Drive {
        Drive::Continue
    }

    fn wake_read(&mut self, _ctx: &mut LoopCtx<'_>) -> Drive {
        Drive::Continue
    }

    fn shutdown(&mut self, registry: &Registry, cause: Option<Cause>) {
        if self.shut {
            return;
        }
        self.shut = true;

        let _ = registry.deregister(&mut self.listener);
        if let Some(shared) = &self.shared_input {
            shared.close();
        }

        if !self.bind_future.is_done() {
            self.bind_future.fail(
                cause
                    .clone()
                    .unwrap_or_else(|| cause_from(ChannelError::Closed)),
            );
        }
        match &cause {
            Some(cause) => {
                warn!(addr = %self.local_addr, %cause, "server channel closed");
                self.close_future.fail(cause.clone());
            }
            None => {
                debug!(addr = %self.local_addr, "server channel closed");
                self.close_future.succeed(());
            }
        }
        emit(
            &self.config.monitor,
            SocketEvent::Closed {
                peer: None,
                cause,
            },
        );
    }
}
