//! Network-wide constants and small socket setup helpers shared by the
//! host listener, peer connections, and the discovery responder.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, SockAddr, Type};

pub const DEFAULT_HOST_PORT: u16 = 6072;
pub const DISCOVERY_PORT: u16 = 6073;
pub const MAX_PACKET_SIZE: usize = 256 * 1024;
pub const LISTEN_QUEUE_SIZE: i32 = 16;

pub const DEFAULT_ENUM_COUNT: u32 = 5;
pub const DEFAULT_ENUM_INTERVAL_MS: u64 = 1500;
pub const DEFAULT_ENUM_TIMEOUT_MS: u64 = 1500;

/// Non-blocking `SO_REUSEADDR` TCP listener with at least
/// [`LISTEN_QUEUE_SIZE`] backlog, bound to `addr`.
pub fn bind_host_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_QUEUE_SIZE)?;

    Ok(socket.into())
}

/// Non-blocking client TCP socket with `SO_LINGER(0, 0)` so a closed
/// connection doesn't linger and block a rapid reconnect to the same peer.
pub fn new_client_socket(addr: SocketAddr) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_linger(Some(std::time::Duration::ZERO))?;
    socket.set_nonblocking(true)?;

    Ok(socket)
}

/// Opens a blocking TCP connection to `addr` with `SO_LINGER(0, 0)` set,
/// so a rapid reconnect to the same peer doesn't stall in `TIME_WAIT`.
pub fn dial(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = new_client_socket(addr)?;
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    socket.set_nonblocking(false)?;
    Ok(socket.into())
}

/// Non-blocking UDP socket with broadcast enabled, bound to `addr`.
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn udp_socket_binds_to_an_ephemeral_port() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let socket = bind_udp_socket(addr).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn host_listener_binds_to_an_ephemeral_port() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let listener = bind_host_listener(addr).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }
}
