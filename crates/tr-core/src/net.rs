//! Network helpers

use std::io;
use std::net::{IpAddr, UdpSocket};

/// Discover the local address used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the OS which interface
/// would route to the target. Agents inside containers need this address
/// (not 127.0.0.1) to reach the server.
pub fn local_ip_addr() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(("8.8.8.8", 1))?;
    Ok(socket.local_addr()?.ip())
}
