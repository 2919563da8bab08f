//! Optional TLS transport (`tls` feature): wraps an already-connected
//! `TcpStream` in a `tokio-rustls` handshake and exposes the result as a
//! plain `Transport`. The handshake itself (certificate verification,
//! cipher suite negotiation) is entirely `tokio-rustls`'s concern — this
//! module is just the `secure(socket) -> transport` step plus the same
//! split-mutex wiring `TcpTransport` uses.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use relay_core::error::Result;
use relay_core::transport::{ShutdownDirection, Transport};

use crate::error::map_io_error;

/// Generic over both `tokio_rustls::client::TlsStream<TcpStream>` and
/// `tokio_rustls::server::TlsStream<TcpStream>`, which differ only in
/// handshake role, not in the `AsyncRead`/`AsyncWrite` surface this crate
/// actually drives.
pub struct TlsTransport<IO> {
    read: AsyncMutex<ReadHalf<IO>>,
    write: AsyncMutex<WriteHalf<IO>>,
}

impl<IO> TlsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn from_stream(stream: IO) -> Arc<dyn Transport> {
        let (read, write) = split(stream);
        Arc::new(Self {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
        })
    }
}

#[async_trait]
impl<IO> Transport for TlsTransport<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.write.lock().await;
        guard.write_all(buf).await.map_err(|e| map_io_error("tls write", e))
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.read.lock().await;
        guard.read(buf).await.map_err(|e| map_io_error("tls read", e))
    }

    /// Every direction sends `close_notify` and shuts the write half down.
    /// Splitting the handshaked stream loses the underlying socket handle,
    /// so there is no OS-level read-only half-close to perform here the
    /// way `TcpTransport` does with `socket2`; a peer that keeps sending
    /// after our `close_notify` is caught downstream as a protocol
    /// violation rather than by the kernel.
    async fn shutdown(&self, _direction: ShutdownDirection) -> Result<()> {
        let mut guard = self.write.lock().await;
        guard.shutdown().await.map_err(|e| map_io_error("tls shutdown", e))
    }

    async fn dispose(&self) {}
}

/// Connects to `addr` and performs a client-side TLS handshake.
pub async fn connect_tls(
    addr: SocketAddr,
    server_name: rustls_pki_types::ServerName<'static>,
    connector: TlsConnector,
) -> Result<Arc<dyn Transport>> {
    let tcp = TcpStream::connect(addr).await.map_err(|e| map_io_error("tcp connect", e))?;
    tcp.set_nodelay(true).map_err(|e| map_io_error("tcp configure", e))?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| map_io_error("tls handshake", e))?;
    Ok(TlsTransport::from_stream(tls_stream))
}

/// Performs a server-side TLS handshake over an already-accepted `tcp`
/// connection.
pub async fn accept_tls(tcp: TcpStream, acceptor: TlsAcceptor) -> Result<Arc<dyn Transport>> {
    let tls_stream = acceptor.accept(tcp).await.map_err(|e| map_io_error("tls handshake", e))?;
    Ok(TlsTransport::from_stream(tls_stream))
}
