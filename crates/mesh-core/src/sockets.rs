use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Create a non-blocking UDP socket bound to `bind_addr:port` and hand
/// it to tokio. Port 0 binds an ephemeral port; the caller reads the
/// actual address back with `local_addr()`.
pub fn bind_udp(bind_addr: &str, port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // On macOS/BSD, multiple binds to the same port also need SO_REUSEPORT
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    let ip: Ipv4Addr = bind_addr.parse()?;
    let addr = SocketAddrV4::new(ip, port);
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_bind_reports_port() {
        let socket = bind_udp("127.0.0.1", 0).unwrap();
        let addr = socket.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn bad_bind_addr_is_an_error() {
        assert!(bind_udp("not-an-ip", 0).is_err());
    }
}
