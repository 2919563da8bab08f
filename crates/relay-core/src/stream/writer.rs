//! Paging stream writer (component G, write side): slices outbound bytes
//! into fixed-size pages and throttles sending against the peer's
//! ack-based credit window, so a fast producer can never outrun however
//! much the reader has acknowledged.
//!
//! State machine: `Created` (no page sent yet) -> `Allowed` (sending pages,
//! spending/regaining credit) -> `Completing` (final page queued, waiting
//! for the last page to actually leave the `TxBuffer`) -> `Closed`.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::TxBuffer;
use crate::dispatcher::MessageDispatcher;
use crate::error::{RelayError, RetCode, Result};
use crate::wire::{encode_preamble, CallId, DecodedMessage, MessageKind};

/// Chunk size used by [`StreamWriter::write_all`] to pull bytes out of an
/// arbitrary `AsyncRead` source before handing them to [`StreamWriter::write`].
/// Independent of the page size: this just bounds one intermediate copy.
const COPY_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Created,
    Allowed,
    Completing,
    Closed,
}

/// Write side of a paging stream for one call.
pub struct StreamWriter {
    call_id: CallId,
    tx: Arc<TxBuffer>,
    acks: mpsc::Receiver<Result<DecodedMessage>>,
    page_size: usize,
    credit: usize,
    sequence: u32,
    pending: BytesMut,
    state: WriterState,
    cancel_token: Option<CancellationToken>,
}

impl StreamWriter {
    /// Registers a new outbound stream for `call_id` with `dispatcher` and
    /// returns the writer. `window` is the number of pages allowed in
    /// flight before the writer must wait for an ack.
    pub fn new(
        call_id: CallId,
        tx: Arc<TxBuffer>,
        dispatcher: &MessageDispatcher,
        page_size: usize,
        window: usize,
    ) -> Self {
        let acks = dispatcher.register_stream(call_id, window);
        Self {
            call_id,
            tx,
            acks,
            page_size,
            credit: window,
            sequence: 0,
            pending: BytesMut::new(),
            state: WriterState::Created,
            cancel_token: None,
        }
    }

    /// Attaches a caller-supplied cancellation token: `write`/`finish` calls
    /// that end up blocking on credit resolve early with `OperationCanceled`
    /// once the token fires, instead of waiting for an ack that may never
    /// come. The stream's dispatcher registration is left untouched by a
    /// cancellation — only the in-flight wait is abandoned.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Buffers `bytes` into the current page, flushing full pages to the
    /// wire (waiting on ack credit as needed) as the accumulator fills up.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state == WriterState::Closed || self.state == WriterState::Completing {
            return Err(RelayError::new(
                RetCode::InvalidChannelState,
                "cannot write to a stream that is completing or closed",
            ));
        }
        self.state = WriterState::Allowed;
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= self.page_size {
            let page = self.pending.split_to(self.page_size);
            self.send_page(&page, false).await?;
        }
        Ok(())
    }

    /// Bridges an arbitrary byte source into this stream: reads `source` to
    /// EOF in `COPY_CHUNK`-sized pulls, calling [`Self::write`] on each
    /// chunk. Does not call [`Self::finish`] — the caller decides when the
    /// stream itself is done, which may be after writing from more than one
    /// source.
    pub async fn write_all<R: AsyncRead + Unpin>(&mut self, source: &mut R) -> Result<u64> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| RelayError::new(RetCode::OtherError, "reading stream source").with_cause(e))?;
            if n == 0 {
                return Ok(total);
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
    }

    /// Flushes any partial final page and sends `StreamCompletion`,
    /// signalling the reader there are no more pages.
    pub async fn finish(mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let page = std::mem::take(&mut self.pending);
            self.send_page(&page, false).await?;
        }
        self.state = WriterState::Completing;
        self.tx
            .write_message(MessageKind::StreamCompletion, true, &self.completion_frame())?;
        self.state = WriterState::Closed;
        debug!(call_id = %self.call_id, "stream writer completed");
        Ok(())
    }

    fn completion_frame(&self) -> BytesMut {
        let mut frame = BytesMut::new();
        encode_preamble(&mut frame, MessageKind::StreamCompletion, self.call_id, None);
        frame
    }

    async fn send_page(&mut self, page: &[u8], _is_final: bool) -> Result<()> {
        if self.credit == 0 {
            self.await_credit().await?;
        }
        let sequence = self.sequence;
        self.sequence += 1;

        let mut frame = BytesMut::new();
        encode_preamble(&mut frame, MessageKind::StreamPage, self.call_id, Some(sequence));
        frame.extend_from_slice(page);
        self.tx.write_message(MessageKind::StreamPage, true, &frame)?;
        self.credit -= 1;
        Ok(())
    }

    async fn await_credit(&mut self) -> Result<()> {
        let ack = if let Some(token) = self.cancel_token.clone() {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(RelayError::new(
                        RetCode::OperationCanceled,
                        "stream writer canceled while waiting for credit",
                    ));
                }
                ack = self.acks.recv() => ack,
            }
        } else {
            self.acks.recv().await
        };

        match ack {
            Some(Ok(message)) if message.kind == MessageKind::StreamAck => {
                self.credit += 1;
                Ok(())
            }
            Some(Ok(message)) => Err(RelayError::new(
                RetCode::ProtocolViolation,
                format!("expected StreamAck, got {:?}", message.kind),
            )),
            Some(Err(fault)) => Err(fault),
            None => Err(RelayError::new(
                RetCode::ChannelClosed,
                "ack channel closed before credit was restored",
            )),
        }
    }
}
