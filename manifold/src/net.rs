//! Socket configuration utilities.
//!
//! # Safety
//!
//! This module uses unsafe code to access raw file descriptors for
//! socket-option configuration. The unsafe operations are encapsulated
//! and safe to use from the crate-internal API.

#![allow(unsafe_code)]

use std::io;

use tracing::debug;

/// Apply `SO_SNDBUF` / `SO_RCVBUF` to any mio socket type.
///
/// Best-effort: a kernel that clamps or rejects the sizes does not fail
/// channel construction.
pub(crate) fn configure_buffers<S>(socket: &S, send_size: usize, receive_size: usize)
where
    S: std::os::fd::AsRawFd,
{
    if let Err(err) = try_configure(socket, send_size, receive_size) {
        debug!(%err, "socket buffer configuration not applied");
    }
}

fn try_configure<S>(socket: &S, send_size: usize, receive_size: usize) -> io::Result<()>
where
    S: std::os::fd::AsRawFd,
{
    use std::os::fd::FromRawFd;

    let fd = socket.as_raw_fd();
    let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
    let result = sock
        .set_send_buffer_size(send_size)
        .and_then(|()| sock.set_recv_buffer_size(receive_size));
    std::mem::forget(sock); // Don't close the fd
    result
}
