//! # Manifold
//!
//! Selector-based message I/O: a small fixed pool of event-loop threads
//! multiplexing many framed TCP, TLS, and UDP channels, exchanging
//! messages with application threads through bounded buffers.
//!
//! ## Architecture
//!
//! Manifold is structured in two layers:
//!
//! - **`manifold-core`**: payload slots, message buffers, codecs, rate
//!   limiting, completions — nothing that touches a socket
//! - **`manifold`**: the selector pool, per-channel processors, server
//!   acceptors, and the channel builders (this crate)
//!
//! Every channel is bound for life to one event-loop thread; all socket
//! I/O, frame coding, and selection-interest changes for it happen
//! there. Application threads talk to the channel only through its two
//! bounded queues, which also carry the backpressure: a full input
//! queue pauses the channel's reads (the TCP window then closes
//! naturally), an empty output queue parks its write side.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manifold::channels;
//! use manifold::pool::SelectorPool;
//! use manifold_core::codec;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = SelectorPool::open("io", 2)?;
//!
//! let server = channels::tcp_server()
//!     .with_pool(&pool)
//!     .with_codec(codec::short(1024))
//!     .bind("127.0.0.1:9000".parse()?)?;
//! server.on_accept(|peer, _channel| println!("accepted {peer}"));
//!
//! let mut client = channels::tcp()
//!     .with_pool(&pool)
//!     .with_codec(codec::short(1024))
//!     .connect("127.0.0.1:9000".parse()?)?;
//! client.wait_connected().expect("connect failed");
//! client.send(b"hello world")?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod acceptor;
pub mod builder;
pub mod channel;
pub mod error;
pub mod monitor;
mod net;
pub mod pool;
mod processor;
mod tcp;
mod tls;
pub mod trace;
mod udp;

pub use builder::{
    QueueKind, TcpChannelBuilder, TcpServerBuilder, TlsChannelBuilder, TlsServerBuilder,
    UdpChannelBuilder,
};
pub use channel::{MessageChannel, ServerChannel};
pub use error::{Cause, ChannelError, ChannelFuture, Result};
pub use monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
pub use pool::{SelectorExecutor, SelectorPool};

/// Builder entry points for every channel flavor.
pub mod channels {
    pub use crate::builder::{tcp, tcp_server, tls, tls_server, udp};
}
