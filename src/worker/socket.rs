//! Helpers to simplify work with UdpSocket.

use std::{io, net::SocketAddr};
use tokio::net::UdpSocket;

/// Large enough for any datagram that fits in an ethernet frame. Bigger KRPC messages are not
/// expected.
const MAX_DATAGRAM_LEN: usize = 1500;

pub(crate) struct Socket(UdpSocket);

impl Socket {
    pub fn new(inner: UdpSocket) -> Self {
        Self(inner)
    }

    pub(crate) async fn send(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        let num_sent = self.0.send_to(bytes, addr).await?;

        if num_sent < bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated",
            ));
        }

        log::trace!("Sent {} bytes to {}", num_sent, addr);

        Ok(())
    }

    /// This function is cancel safe: https://docs.rs/tokio/1.12.0/tokio/net/struct.UdpSocket.html#cancel-safety-6
    pub(crate) async fn recv(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
        let (size, addr) = self.0.recv_from(&mut buffer).await?;
        buffer.truncate(size);

        log::trace!("Received {} bytes from {}", size, addr);

        Ok((buffer, addr))
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }
}
