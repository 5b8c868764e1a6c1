// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Listening and outbound socket setup.
//!
//! Listeners come in two shapes: `UNIQUE_TCP`, where each worker binds
//! its own socket with `SO_REUSEPORT` and the kernel spreads accepts, or
//! shared, where a single bound socket is multiplexed into each worker's
//! poll. `SO_REUSEPORT` support is detected at runtime (kernels >= 3.9);
//! when the kernel refuses, the caller falls back to shared mode.

use crate::server::ServerAddress;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// How client sockets are distributed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Each worker binds its own socket with `SO_REUSEPORT`.
    UniqueTcp,
    /// One bound socket, multiplexed into every worker's poll.
    Shared,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    pub mode: ListenMode,
    /// Bind even when the interface is not up yet (`IP_FREEBIND`).
    pub free_bind: bool,
    pub backlog: i32,
}

impl ListenerConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            mode: ListenMode::UniqueTcp,
            free_bind: false,
            backlog: 1024,
        }
    }
}

/// Outcome of binding one listener socket.
#[derive(Debug)]
pub struct BoundListener {
    pub listener: TcpListener,
    /// The mode actually in effect; `UniqueTcp` downgrades to `Shared`
    /// when the kernel lacks `SO_REUSEPORT`.
    pub mode: ListenMode,
}

/// Bind a listening socket per the config.
pub fn bind(config: &ListenerConfig) -> io::Result<BoundListener> {
    let domain = if config.address.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let mut mode = config.mode;
    if mode == ListenMode::UniqueTcp {
        if let Err(error) = socket.set_reuse_port(true) {
            log::warn!("[LISTENER] SO_REUSEPORT unavailable ({error}); using a shared socket");
            mode = ListenMode::Shared;
        }
    }

    if config.free_bind {
        if let Err(error) = socket.set_freebind(true) {
            // Interface-not-up binds will fail the ordinary way.
            log::warn!("[LISTENER] IP_FREEBIND unavailable: {error}");
        }
    }

    socket.bind(&config.address.into())?;
    socket.listen(config.backlog)?;

    let listener = TcpListener::from_std(socket.into());
    Ok(BoundListener { listener, mode })
}

/// Options applied to every accepted client socket.
pub fn prepare_client_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

/// Connect to a backend.
///
/// TCP targets resolve via `getaddrinfo` (v4 and v6); UNIX sockets are
/// selected by a leading `/` in the configured address. The optional
/// `local_address` binds the source address; a failure there is logged
/// and the default local address is used instead.
///
/// Name resolution can block; callers on a worker thread wrap this in
/// the watchdog workaround.
pub fn connect_outbound(
    address: &ServerAddress,
    local_address: Option<SocketAddr>,
) -> io::Result<OutboundStream> {
    match address {
        ServerAddress::Unix { path } => {
            let stream = std::os::unix::net::UnixStream::connect(path)?;
            stream.set_nonblocking(true)?;
            Ok(OutboundStream::Unix(mio::net::UnixStream::from_std(stream)))
        }
        ServerAddress::Tcp { host, port } => {
            let mut last_error = None;
            for target in (host.as_str(), *port).to_socket_addrs()? {
                match connect_tcp(target, local_address) {
                    Ok(stream) => return Ok(OutboundStream::Tcp(stream)),
                    Err(error) => last_error = Some(error),
                }
            }
            Err(last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses")))
        }
    }
}

fn connect_tcp(target: SocketAddr, local_address: Option<SocketAddr>) -> io::Result<TcpStream> {
    let domain = if target.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    if let Some(local) = local_address {
        if let Err(error) = socket.bind(&local.into()) {
            log::error!(
                "[LISTENER] binding local address {local} failed ({error}); \
                 using the default local address"
            );
        }
    }

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&target.into()) {
        Ok(()) => {}
        // Non-blocking connect completes asynchronously.
        Err(error) if error.raw_os_error() == Some(libc_einprogress()) => {}
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
        Err(error) => return Err(error),
    }
    Ok(TcpStream::from_std(socket.into()))
}

/// A connected outbound socket.
#[derive(Debug)]
pub enum OutboundStream {
    Tcp(TcpStream),
    Unix(mio::net::UnixStream),
}

const fn libc_einprogress() -> i32 {
    // EINPROGRESS on every Linux target the proxy supports.
    115
}
