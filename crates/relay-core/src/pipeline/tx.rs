//! TxPipeline (component D): the task that drains [`TxBuffer`] segments and
//! pushes their bytes out over the [`Transport`], grounded on the same
//! read/write-loop shape as the teacher's TCP channel (`run_with_context`
//! wrapping a single `write` call per buffer) but driven by `TxBuffer`
//! segments instead of caller-supplied slices.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::buffer::TxBuffer;
use crate::error::{RelayError, RetCode, Result};
use crate::transport::Transport;

/// Drains `tx` until it is closed and empty, writing each segment to
/// `transport` in turn. Returns once `TxBuffer::dequeue` yields its closing
/// `None` sentinel; any transport error is treated as fatal to the whole
/// channel and returned to the caller.
///
/// `grace_period` bounds how long a final drain (after `tx.close()`) is
/// allowed to take before pending segments are abandoned — this is what
/// lets a graceful shutdown flush outstanding frames without hanging
/// forever on an unresponsive peer.
pub async fn run_tx_pipeline(
    tx: Arc<TxBuffer>,
    transport: Arc<dyn Transport>,
    grace_period: Duration,
) -> Result<()> {
    loop {
        let segment = match tx.dequeue().await {
            Some(segment) => segment,
            None => {
                debug!("tx pipeline drained and closed, exiting");
                return Ok(());
            }
        };

        let bytes = segment.as_bytes();
        let write = transport.send(bytes);
        let outcome = if tx.is_closed() {
            timeout(grace_period, write).await.map_err(|_| {
                RelayError::new(
                    RetCode::ConnectionTimeout,
                    "tx pipeline grace period elapsed while draining final segments",
                )
            })?
        } else {
            write.await
        };

        if let Err(err) = outcome {
            warn!(error = %err, "tx pipeline write failed, aborting");
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SegmentPool;
    use crate::wire::MessageKind;
    use parking_lot::Mutex;

    struct RecordingTransport {
        written: Mutex<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, buf: &[u8]) -> Result<()> {
            self.written.lock().extend_from_slice(buf);
            Ok(())
        }
        async fn receive(&self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        async fn shutdown(&self, _direction: crate::transport::ShutdownDirection) -> Result<()> {
            Ok(())
        }
        async fn dispose(&self) {}
    }

    #[tokio::test]
    async fn drains_until_closed_and_writes_everything() {
        let pool = SegmentPool::new(256);
        let tx = Arc::new(TxBuffer::new(pool));
        tx.write_message(MessageKind::Request, true, &[1, 2, 3]).unwrap();
        tx.close();

        let transport = Arc::new(RecordingTransport {
            written: Mutex::new(Vec::new()),
        });
        run_tx_pipeline(tx, transport.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!transport.written.lock().is_empty());
    }
}
