//! In-process [`Transport`] pair for contract tests, backed by
//! `tokio::io::duplex` instead of a real socket. Shared by this crate's own
//! unit tests and by `relay-core/tests/`'s integration suite so neither has
//! to stand up a TCP listener just to exercise the connection core.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{RelayError, RetCode, Result};
use crate::transport::{ShutdownDirection, Transport};

/// One end of an in-memory duplex pipe wearing the [`Transport`] trait.
struct DuplexTransport {
    read_half: AsyncMutex<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
    write_half: AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
}

impl DuplexTransport {
    fn from_stream(stream: tokio::io::DuplexStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            read_half: AsyncMutex::new(read_half),
            write_half: AsyncMutex::new(write_half),
        }
    }
}

#[async_trait::async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, buf: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.write_half.lock().await;
        guard
            .write_all(buf)
            .await
            .map_err(|e| RelayError::new(RetCode::OtherConnectionError, e.to_string()))
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        use tokio::io::AsyncReadExt;
        let mut guard = self.read_half.lock().await;
        guard
            .read(buf)
            .await
            .map_err(|e| RelayError::new(RetCode::OtherConnectionError, e.to_string()))
    }

    async fn shutdown(&self, _direction: ShutdownDirection) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.write_half.lock().await;
        guard
            .shutdown()
            .await
            .map_err(|e| RelayError::new(RetCode::OtherConnectionError, e.to_string()))
    }

    async fn dispose(&self) {}
}

/// Builds two connected [`Transport`]s, each the other's peer. Bytes
/// written to one side's `send` become readable from the other side's
/// `receive`, same as a real socket pair.
pub fn duplex_pair(buffer_size: usize) -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (a, b) = tokio::io::duplex(buffer_size);
    (
        Arc::new(DuplexTransport::from_stream(a)),
        Arc::new(DuplexTransport::from_stream(b)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_written_on_one_side_are_readable_on_the_other() {
        let (a, b) = duplex_pair(1024);
        a.send(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = b.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
