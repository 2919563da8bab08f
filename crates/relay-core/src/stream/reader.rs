//! Paging stream reader (component G, read side): receives `StreamPage`
//! frames via the dispatcher, hands their bytes to the caller in order,
//! and acks each page back to the writer so its credit window refills.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::TxBuffer;
use crate::dispatcher::MessageDispatcher;
use crate::error::{RelayError, RetCode, Result};
use crate::wire::{encode_preamble, CallId, DecodedMessage, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Completed,
}

/// Read side of a paging stream for one call.
pub struct StreamReader {
    call_id: CallId,
    tx: Arc<TxBuffer>,
    pages: mpsc::Receiver<Result<DecodedMessage>>,
    state: ReaderState,
    cancel_token: Option<CancellationToken>,
}

impl StreamReader {
    pub fn new(call_id: CallId, tx: Arc<TxBuffer>, dispatcher: &MessageDispatcher, window: usize) -> Self {
        let pages = dispatcher.register_stream(call_id, window);
        Self {
            call_id,
            tx,
            pages,
            state: ReaderState::Open,
            cancel_token: None,
        }
    }

    /// Attaches a caller-supplied cancellation token: a `next_page`/`drain`
    /// call blocked waiting for the next page resolves early with
    /// `OperationCanceled` once the token fires, without acking or dropping
    /// any page that had already arrived.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Returns the next page's bytes, `None` once the stream has reached
    /// `StreamCompletion`. Acks every page immediately upon receipt —
    /// this core acks receipt, not application-level processing, keeping
    /// the credit window simple at the cost of only bounding in-flight
    /// bytes rather than unprocessed bytes.
    pub async fn next_page(&mut self) -> Result<Option<Bytes>> {
        if self.state == ReaderState::Completed {
            return Ok(None);
        }
        loop {
            let next = if let Some(token) = self.cancel_token.clone() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Err(RelayError::new(
                            RetCode::OperationCanceled,
                            "stream reader canceled while waiting for a page",
                        ));
                    }
                    message = self.pages.recv() => message,
                }
            } else {
                self.pages.recv().await
            };

            match next {
                Some(Ok(message)) => match message.kind {
                    MessageKind::StreamPage => {
                        self.send_ack(message.sequence.unwrap_or_default())?;
                        return Ok(Some(message.body));
                    }
                    MessageKind::StreamCompletion => {
                        self.state = ReaderState::Completed;
                        debug!(call_id = %self.call_id, "stream reader observed completion");
                        return Ok(None);
                    }
                    other => {
                        return Err(RelayError::new(
                            RetCode::ProtocolViolation,
                            format!("unexpected frame kind {other:?} on a paging stream"),
                        ));
                    }
                },
                Some(Err(fault)) => return Err(fault),
                None => {
                    return Err(RelayError::new(
                        RetCode::ChannelClosed,
                        "stream delivery channel closed before StreamCompletion arrived",
                    ));
                }
            }
        }
    }

    /// Drains the stream to completion, discarding page bodies. Useful
    /// when a caller only needs the terminal fault/ok outcome.
    pub async fn drain(&mut self) -> Result<()> {
        while self.next_page().await?.is_some() {}
        Ok(())
    }

    /// Bridges this stream into an arbitrary byte sink: writes each page's
    /// bytes to `sink` in order as it arrives, returning the total byte
    /// count once `StreamCompletion` is observed.
    pub async fn read_all<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> Result<u64> {
        let mut total = 0u64;
        while let Some(page) = self.next_page().await? {
            total += page.len() as u64;
            sink.write_all(&page)
                .await
                .map_err(|e| RelayError::new(RetCode::OtherError, "writing stream sink").with_cause(e))?;
        }
        Ok(total)
    }

    fn send_ack(&self, sequence: u32) -> Result<()> {
        let mut frame = BytesMut::new();
        encode_preamble(&mut frame, MessageKind::StreamAck, self.call_id, Some(sequence));
        self.tx.write_message(MessageKind::StreamAck, true, &frame)
    }
}
