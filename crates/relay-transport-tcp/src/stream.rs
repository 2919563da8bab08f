//! [`TcpTransport`]: the plain (non-TLS) `Transport` adapter over
//! `tokio::net::TcpStream`.
//!
//! Split into owned read/write halves up front, each behind its own
//! `tokio::sync::Mutex`, rather than the teacher's single `AsyncMutex`
//! around the whole stream: `relay-core`'s `Channel` runs its Tx and Rx
//! pipelines as two independent, long-lived tasks (the Rx task spends most
//! of its life parked in `receive`), so one mutex guarding both directions
//! would let a quiet connection starve every outbound write. Splitting
//! costs nothing here since `TcpStream::into_split` shares the socket
//! behind the halves internally.

use std::io;
use std::net::Shutdown as StdShutdown;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use relay_core::error::Result;
use relay_core::transport::{ShutdownDirection, Transport};

use crate::error::map_io_error;

pub struct TcpTransport {
    read: AsyncMutex<OwnedReadHalf>,
    write: AsyncMutex<OwnedWriteHalf>,
}

impl TcpTransport {
    /// Connects to `addr`, disables Nagle's algorithm (small RPC frames
    /// shouldn't wait on a coalescing timer), and wraps the result.
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr).await.map_err(|e| map_io_error("tcp connect", e))?;
        stream.set_nodelay(true).map_err(|e| map_io_error("tcp configure", e))?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already-connected stream, e.g. one handed back by
    /// [`crate::listener::TcpListener::accept`].
    pub fn from_stream(stream: TcpStream) -> Arc<dyn Transport> {
        let (read, write) = stream.into_split();
        Arc::new(Self {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
        })
    }
}

fn sync_shutdown(half: &OwnedReadHalf, direction: StdShutdown) -> io::Result<()> {
    SockRef::from(half).shutdown(direction)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.write.lock().await;
        guard.write_all(buf).await.map_err(|e| map_io_error("tcp write", e))
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.read.lock().await;
        guard.read(buf).await.map_err(|e| map_io_error("tcp read", e))
    }

    async fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        match direction {
            ShutdownDirection::Write => {
                let mut guard = self.write.lock().await;
                guard.shutdown().await.map_err(|e| map_io_error("tcp shutdown", e))
            }
            ShutdownDirection::Read => {
                let guard = self.read.lock().await;
                sync_shutdown(&guard, StdShutdown::Read).map_err(|e| map_io_error("tcp shutdown", e))
            }
            ShutdownDirection::Both => {
                let mut write_guard = self.write.lock().await;
                write_guard.shutdown().await.map_err(|e| map_io_error("tcp shutdown", e))?;
                let read_guard = self.read.lock().await;
                sync_shutdown(&read_guard, StdShutdown::Read).map_err(|e| map_io_error("tcp shutdown", e))
            }
        }
    }

    async fn dispose(&self) {
        debug!("tcp transport disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connected_pair_exchanges_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::from_stream(stream)
        });

        let client = TcpTransport::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = server.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn write_shutdown_is_observed_as_eof_by_the_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::from_stream(stream)
        });

        let client = TcpTransport::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        client.shutdown(ShutdownDirection::Write).await.unwrap();
        let mut buf = [0u8; 4];
        let n = server.receive(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
