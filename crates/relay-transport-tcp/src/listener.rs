//! Thin wrapper over `tokio::net::TcpListener`: bind, then hand each
//! accepted connection back as a `Transport` the hosting layer can build a
//! `Channel` around.

use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::error::Result;
use relay_core::transport::Transport;

use crate::error::map_io_error;
use crate::stream::TcpTransport;

pub struct TcpListener {
    inner: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await.map_err(|e| map_io_error("tcp bind", e))?;
        let local_addr = inner.local_addr().map_err(|e| map_io_error("tcp bind", e))?;
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts one inbound connection, returning it already wrapped as a
    /// `Transport` plus the peer's address.
    pub async fn accept(&self) -> Result<(Arc<dyn Transport>, SocketAddr)> {
        let (stream, peer_addr) = self.inner.accept().await.map_err(|e| map_io_error("tcp accept", e))?;
        stream.set_nodelay(true).map_err(|e| map_io_error("tcp configure", e))?;
        Ok((TcpTransport::from_stream(stream), peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_returns_a_working_transport() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr();

        let server = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client = TcpTransport::connect(addr).await.unwrap();
        let (server_transport, _peer_addr) = server.await.unwrap();

        client.send(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        let n = server_transport.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
