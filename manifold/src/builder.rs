//! Channel builders.
//!
//! Helpers to create message channels, mirroring the option set of the
//! socket layer: the pool to attach to, queue capacity and
//! implementation, socket buffer sizes, the codec (or a body-length
//! shorthand for the default int-header codec), and the rate limiter.
//! Server builders additionally choose between one input buffer per
//! accepted channel and a single shared one (fan-in).
//!
//! ```no_run
//! use manifold::channels;
//! use manifold::pool::SelectorPool;
//! use manifold_core::codec;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = SelectorPool::open("io", 2)?;
//! let mut channel = channels::tcp()
//!     .with_pool(&pool)
//!     .with_codec(codec::short(1024))
//!     .connect("127.0.0.1:9000".parse()?)?;
//! channel.wait_connected().expect("connect failed");
//! channel.send(b"hello world")?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use manifold_core::buffer::{blocking_queue, ring_buffer, MessageConsumer, MessageProducer};
use manifold_core::codec::{default_codec, MessageCodec};
use manifold_core::limit::{NullLimiter, RateLimiter, RateUnit, TokenBucketLimiter};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, Connection};

use crate::acceptor::{AcceptorDriver, ChildConfig};
use crate::channel::{ChannelFutures, MessageChannel, ServerChannel};
use crate::error::{ChannelError, ChannelFuture, Result};
use crate::monitor::SocketEventSender;
use crate::net::configure_buffers;
use crate::pool::{read_wakeup, write_wakeup, Driver, SelectorPool};
use crate::processor::ProcessorCore;
use crate::tcp::TcpDriver;
use crate::tls::TlsDriver;
use crate::udp::UdpDriver;

const DEFAULT_BUFFER_CAPACITY: usize = 256;
const DEFAULT_SOCKET_BUFFER: usize = 0xFFFF;

/// Message buffer implementation behind a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Lock-free ring, spin-then-park blocking.
    Ring,
    /// Mutex and condition variables.
    Blocking,
}

pub(crate) fn make_queue(
    kind: QueueKind,
    capacity: usize,
    slot_size: usize,
) -> (Box<dyn MessageProducer>, Box<dyn MessageConsumer>) {
    match kind {
        QueueKind::Ring => {
            let (producer, consumer) = ring_buffer(capacity, slot_size);
            (Box::new(producer), Box::new(consumer))
        }
        QueueKind::Blocking => {
            let (producer, consumer) = blocking_queue(capacity, slot_size);
            (Box::new(producer), Box::new(consumer))
        }
    }
}

struct CommonOptions {
    pool: Option<SelectorPool>,
    capacity: usize,
    send_buffer: usize,
    receive_buffer: usize,
    queue: QueueKind,
    monitor: Option<SocketEventSender>,
}

impl Default for CommonOptions {
    fn default() -> Self {
        Self {
            pool: None,
            capacity: DEFAULT_BUFFER_CAPACITY,
            send_buffer: DEFAULT_SOCKET_BUFFER,
            receive_buffer: DEFAULT_SOCKET_BUFFER,
            queue: QueueKind::Blocking,
            monitor: None,
        }
    }
}

struct CodecOptions {
    codec: Option<Box<dyn MessageCodec>>,
    limiter: Box<dyn RateLimiter>,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            codec: None,
            limiter: Box::new(NullLimiter),
        }
    }
}

macro_rules! common_options {
    () => {
        /// The selector pool to attach to. Mandatory.
        #[must_use]
        pub fn with_pool(mut self, pool: &SelectorPool) -> Self {
            self.common.pool = Some(pool.clone());
            self
        }

        /// Slots per message buffer. Default 256.
        #[must_use]
        pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
            assert!(capacity > 0, "capacity must be positive");
            self.common.capacity = capacity;
            self
        }

        /// Socket send buffer size. Default 65535.
        #[must_use]
        pub fn with_send_buffer_size(mut self, size: usize) -> Self {
            assert!(size > 0, "send buffer size must be positive");
            self.common.send_buffer = size;
            self
        }

        /// Socket receive buffer size. Default 65535.
        #[must_use]
        pub fn with_receive_buffer_size(mut self, size: usize) -> Self {
            assert!(size > 0, "receive buffer size must be positive");
            self.common.receive_buffer = size;
            self
        }

        /// Back the message buffers with the lock-free ring.
        #[must_use]
        pub fn use_ring_buffer(mut self) -> Self {
            self.common.queue = QueueKind::Ring;
            self
        }

        /// Back the message buffers with the blocking queue (default).
        #[must_use]
        pub fn use_blocking_queue(mut self) -> Self {
            self.common.queue = QueueKind::Blocking;
            self
        }

        /// Stream lifecycle events to `sender`.
        #[must_use]
        pub fn with_monitor(mut self, sender: SocketEventSender) -> Self {
            self.common.monitor = Some(sender);
            self
        }
    };
}

macro_rules! codec_options {
    () => {
        /// The framing codec. Mandatory unless
        /// [`with_message_length`](Self::with_message_length) is used.
        #[must_use]
        pub fn with_codec(mut self, codec: impl MessageCodec + 'static) -> Self {
            self.codec.codec = Some(Box::new(codec));
            self
        }

        /// Shorthand: the default int-header codec with the given body
        /// length.
        #[must_use]
        pub fn with_message_length(mut self, body_length: usize) -> Self {
            self.codec.codec = Some(Box::new(default_codec(body_length)));
            self
        }

        /// Per-channel rate limiter. Default: unmetered.
        #[must_use]
        pub fn with_rate_limiter(mut self, limiter: impl RateLimiter + 'static) -> Self {
            self.codec.limiter = Box::new(limiter);
            self
        }

        /// Shorthand: token bucket at `value` per `unit`.
        #[must_use]
        pub fn with_rate_limit(mut self, value: u64, unit: RateUnit) -> Self {
            self.codec.limiter = Box::new(TokenBucketLimiter::new(value, unit));
            self
        }
    };
}

// ============================================================================
// Client builders
// ============================================================================

/// Builder for outbound TCP channels.
#[derive(Default)]
pub struct TcpChannelBuilder {
    common: CommonOptions,
    codec: CodecOptions,
}

impl TcpChannelBuilder {
    common_options!();
    codec_options!();

    /// Open the channel and start the non-blocking connect. The connect
    /// future completes once the socket is established.
    pub fn connect(self, addr: SocketAddr) -> Result<MessageChannel> {
        open_stream(self.common, self.codec, addr, None)
    }
}

/// Builder for outbound TLS channels.
#[derive(Default)]
pub struct TlsChannelBuilder {
    common: CommonOptions,
    codec: CodecOptions,
    context: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<String>,
}

impl TlsChannelBuilder {
    common_options!();
    codec_options!();

    /// The TLS context providing sessions. Mandatory.
    #[must_use]
    pub fn with_context(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.context = Some(config);
        self
    }

    /// Name presented for SNI and certificate validation. Defaults to
    /// the peer IP address.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Open the channel. The connect future completes once the TLS
    /// handshake finished.
    pub fn connect(self, addr: SocketAddr) -> Result<MessageChannel> {
        let context = self
            .context
            .ok_or(ChannelError::Config("TLS context is required"))?;
        let name = self
            .server_name
            .unwrap_or_else(|| addr.ip().to_string());
        let server_name = ServerName::try_from(name)
            .map_err(|_| ChannelError::Config("invalid TLS server name"))?;
        let session = ClientConnection::new(context, server_name)?;
        open_stream(
            self.common,
            self.codec,
            addr,
            Some(Connection::Client(session)),
        )
    }
}

/// Builder for UDP channels.
#[derive(Default)]
pub struct UdpChannelBuilder {
    common: CommonOptions,
    codec: CodecOptions,
}

impl UdpChannelBuilder {
    common_options!();
    codec_options!();

    /// Bind an ephemeral local port and fix `addr` as the peer.
    pub fn connect(self, addr: SocketAddr) -> Result<MessageChannel> {
        let local: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("constant address")
        } else {
            "[::]:0".parse().expect("constant address")
        };
        open_datagram(self.common, self.codec, local, Some(addr))
    }

    /// Bind `addr` and receive from any peer. The channel is
    /// receive-only; messages published to its output are discarded.
    pub fn bind(self, addr: SocketAddr) -> Result<MessageChannel> {
        open_datagram(self.common, self.codec, addr, None)
    }
}

// ============================================================================
// Server builders
// ============================================================================

/// How accepted channels receive: one input buffer each, or a single
/// shared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    Multiple,
    Single,
}

/// Builder for TCP server channels.
pub struct TcpServerBuilder {
    common: CommonOptions,
    codec: CodecOptions,
    input: InputMode,
}

impl Default for TcpServerBuilder {
    fn default() -> Self {
        Self {
            common: CommonOptions::default(),
            codec: CodecOptions::default(),
            input: InputMode::Multiple,
        }
    }
}

impl TcpServerBuilder {
    common_options!();
    codec_options!();

    /// Fan every accepted channel into one shared input buffer, read
    /// from the server channel.
    #[must_use]
    pub fn use_single_input_buffer(mut self) -> Self {
        self.input = InputMode::Single;
        self
    }

    /// Give each accepted channel its own input buffer (default).
    #[must_use]
    pub fn use_multiple_input_buffers(mut self) -> Self {
        self.input = InputMode::Multiple;
        self
    }

    /// Bind and start accepting. The bind future completes once the
    /// listener is registered.
    pub fn bind(self, addr: SocketAddr) -> Result<ServerChannel> {
        bind_server(self.common, self.codec, self.input, addr, None)
    }
}

/// Builder for TLS server channels.
pub struct TlsServerBuilder {
    common: CommonOptions,
    codec: CodecOptions,
    input: InputMode,
    context: Option<Arc<rustls::ServerConfig>>,
}

impl Default for TlsServerBuilder {
    fn default() -> Self {
        Self {
            common: CommonOptions::default(),
            codec: CodecOptions::default(),
            input: InputMode::Multiple,
            context: None,
        }
    }
}

impl TlsServerBuilder {
    common_options!();
    codec_options!();

    /// The TLS context providing sessions. Mandatory.
    #[must_use]
    pub fn with_context(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.context = Some(config);
        self
    }

    /// Fan every accepted channel into one shared input buffer.
    #[must_use]
    pub fn use_single_input_buffer(mut self) -> Self {
        self.input = InputMode::Single;
        self
    }

    /// Give each accepted channel its own input buffer (default).
    #[must_use]
    pub fn use_multiple_input_buffers(mut self) -> Self {
        self.input = InputMode::Multiple;
        self
    }

    /// Bind and start accepting TLS connections.
    pub fn bind(self, addr: SocketAddr) -> Result<ServerChannel> {
        let context = self
            .context
            .ok_or(ChannelError::Config("TLS context is required"))?;
        bind_server(self.common, self.codec, self.input, addr, Some(context))
    }
}

// ============================================================================
// Assembly
// ============================================================================

fn open_stream(
    common: CommonOptions,
    codec_opts: CodecOptions,
    addr: SocketAddr,
    tls: Option<Connection>,
) -> Result<MessageChannel> {
    let pool = common
        .pool
        .ok_or(ChannelError::Config("pool is required"))?;
    let codec = codec_opts
        .codec
        .ok_or(ChannelError::Config("codec is required"))?;

    let stream = TcpStream::connect(addr)?;
    let _ = stream.set_nodelay(true);
    configure_buffers(&stream, common.send_buffer, common.receive_buffer);
    let local_addr = stream.local_addr().ok();

    let slot_size = codec.body_length();
    let (app_out, mut chn_in) = make_queue(common.queue, common.capacity, slot_size);
    let (mut chn_out, app_in) = make_queue(common.queue, common.capacity, slot_size);

    let futures = ChannelFutures::new();
    let token = pool.token();
    let executor = pool.next();
    chn_in.attach_wakeup(write_wakeup(&executor, token));
    chn_out.attach_wakeup(read_wakeup(&executor, token));

    let core = ProcessorCore::new(
        codec,
        codec_opts.limiter,
        chn_in,
        chn_out,
        common.receive_buffer,
    );
    let driver: Box<dyn Driver> = match tls {
        Some(session) => Box::new(TlsDriver::connecting(
            stream,
            session,
            token,
            core,
            addr,
            &futures,
            common.monitor.clone(),
        )),
        None => Box::new(TcpDriver::connecting(
            stream,
            token,
            core,
            addr,
            &futures,
            common.monitor.clone(),
        )),
    };

    let channel = MessageChannel::new(
        executor.clone(),
        token,
        app_out,
        Some(app_in),
        futures.connect.clone(),
        futures.close.clone(),
        local_addr,
        Some(addr),
        None,
    );
    executor.execute(Box::new(move |lp| lp.install(token, driver)));
    Ok(channel)
}

fn open_datagram(
    common: CommonOptions,
    codec_opts: CodecOptions,
    local: SocketAddr,
    peer: Option<SocketAddr>,
) -> Result<MessageChannel> {
    let pool = common
        .pool
        .ok_or(ChannelError::Config("pool is required"))?;
    let codec = codec_opts
        .codec
        .ok_or(ChannelError::Config("codec is required"))?;

    let socket = UdpSocket::bind(local)?;
    if let Some(peer) = peer {
        socket.connect(peer)?;
    }
    configure_buffers(&socket, common.send_buffer, common.receive_buffer);
    let local_addr = socket.local_addr().ok();

    let slot_size = codec.body_length();
    let (app_out, mut chn_in) = make_queue(common.queue, common.capacity, slot_size);
    let (mut chn_out, app_in) = make_queue(common.queue, common.capacity, slot_size);

    let futures = ChannelFutures::new();
    let token = pool.token();
    let executor = pool.next();
    chn_in.attach_wakeup(write_wakeup(&executor, token));
    chn_out.attach_wakeup(read_wakeup(&executor, token));

    // Datagram reads need room for a whole datagram regardless of the
    // configured socket buffer.
    let scratch = common.receive_buffer.max(manifold_core::codec::MAX_DATAGRAM_PAYLOAD);
    let core = ProcessorCore::new(codec, codec_opts.limiter, chn_in, chn_out, scratch);

    let dropped = Arc::new(AtomicU64::new(0));
    let driver = Box::new(UdpDriver::new(
        socket,
        token,
        core,
        peer,
        Arc::clone(&dropped),
        &futures,
        common.monitor.clone(),
    ));

    let channel = MessageChannel::new(
        executor.clone(),
        token,
        app_out,
        Some(app_in),
        futures.connect.clone(),
        futures.close.clone(),
        local_addr,
        peer,
        Some(dropped),
    );
    executor.execute(Box::new(move |lp| lp.install(token, driver)));
    Ok(channel)
}

fn bind_server(
    common: CommonOptions,
    codec_opts: CodecOptions,
    input: InputMode,
    addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Result<ServerChannel> {
    let pool = common
        .pool
        .ok_or(ChannelError::Config("pool is required"))?;
    let codec = codec_opts
        .codec
        .ok_or(ChannelError::Config("codec is required"))?;

    let listener = TcpListener::bind(addr)?;
    let local_addr = listener.local_addr()?;

    let (shared_producer, shared_consumer) = match input {
        InputMode::Single => {
            let (producer, consumer) =
                make_queue(common.queue, common.capacity, codec.body_length());
            (Some(producer), Some(consumer))
        }
        InputMode::Multiple => (None, None),
    };

    let token = pool.token();
    let executor = pool.next();
    let bind_future = ChannelFuture::new();
    let close_future = ChannelFuture::new();
    let accept_slot = Arc::new(Mutex::new(None));
    let close_slot = Arc::new(Mutex::new(None));

    let config = ChildConfig {
        pool: pool.clone(),
        capacity: common.capacity,
        queue: common.queue,
        send_buffer: common.send_buffer,
        recv_buffer: common.receive_buffer,
        codec,
        limiter: codec_opts.limiter,
        tls,
        monitor: common.monitor.clone(),
    };
    let driver = Box::new(AcceptorDriver::new(
        listener,
        token,
        config,
        shared_producer,
        Arc::clone(&accept_slot),
        Arc::clone(&close_slot),
        bind_future.clone(),
        close_future.clone(),
        local_addr,
    ));

    let server = ServerChannel::new(
        executor.clone(),
        token,
        bind_future,
        close_future,
        accept_slot,
        close_slot,
        shared_consumer,
        local_addr,
    );
    executor.execute(Box::new(move |lp| lp.install(token, driver)));
    Ok(server)
}

// ============================================================================
// Entry points
// ============================================================================

/// Builder for an outbound TCP channel.
#[must_use]
pub fn tcp() -> TcpChannelBuilder {
    TcpChannelBuilder::default()
}

/// Builder for an outbound TLS channel.
#[must_use]
pub fn tls() -> TlsChannelBuilder {
    TlsChannelBuilder::default()
}

/// Builder for a UDP channel.
#[must_use]
pub fn udp() -> UdpChannelBuilder {
    UdpChannelBuilder::default()
}

/// Builder for a TCP server channel.
#[must_use]
pub fn tcp_server() -> TcpServerBuilder {
    TcpServerBuilder::default()
}

/// Builder for a TLS server channel.
#[must_use]
pub fn tls_server() -> TlsServerBuilder {
    TlsServerBuilder::default()
}
