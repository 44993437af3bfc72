use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram, introduced to facilitate mocking the I/O
///  part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);

        let num_sent = UdpSocket::send_to(self, buf, to).await?;
        if num_sent < buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, format!("sent {} of {} bytes", num_sent, buf.len())));
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}
