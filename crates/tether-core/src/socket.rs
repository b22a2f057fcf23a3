//! Datagram socket abstraction.
//!
//! The engine talks to an abstract [`DatagramSocket`] instead of a
//! concrete UDP socket, so the test harness can substitute an in-memory
//! network with packet loss and injected latency without touching any
//! engine or façade code. Production runs on `tokio::net::UdpSocket`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Abstract connectionless datagram transport.
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Send one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receive one datagram, returning its size and origin.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// The locally bound address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind a UDP socket for use with the façades. Port `0` asks the OS to
/// assign one.
///
/// # Errors
///
/// Propagates resolution and bind failures.
pub async fn bind_udp(host: &str, port: u16) -> io::Result<Arc<dyn DatagramSocket>> {
    let socket = UdpSocket::bind((host, port)).await?;
    Ok(Arc::new(socket))
}
