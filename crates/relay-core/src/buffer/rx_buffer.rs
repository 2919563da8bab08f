//! RxBuffer & parser (component C): accepts incoming bytes and emits
//! message boundaries, joining continuation chunks back into whole
//! messages before they ever reach the dispatcher.
//!
//! Unlike [`crate::buffer::TxBuffer`], the receive side has no reason to
//! hand discrete [`crate::buffer::Segment`] objects back and forth: bytes
//! arrive from the transport in syscall-sized chunks unrelated to the
//! sender's segment boundaries, and the parser just needs a single
//! growing-then-compacting accumulator. `reserve_window`/`commit_rx` still
//! give the transport a pool-sized writable window each call (mirroring
//! §4.3's `get_rx_segment`/`commit_rx` pair) without pretending there's a
//! discrete `Segment` changing hands on this side.

use bytes::{Buf, Bytes, BytesMut};

use crate::buffer::segment::SegmentPool;
use crate::error::{RelayError, RetCode, Result};
use crate::wire::{decode_preamble, DecodedMessage, MessageHeader, MessageKind, HEADER_LEN};

struct PartialMessage {
    kind: MessageKind,
    accumulated: BytesMut,
}

pub struct RxBuffer {
    pool: SegmentPool,
    buf: BytesMut,
    in_progress: Option<PartialMessage>,
}

impl RxBuffer {
    pub fn new(pool: SegmentPool) -> Self {
        Self {
            pool,
            buf: BytesMut::new(),
            in_progress: None,
        }
    }

    /// Grows the accumulator by one pool-sized window and returns it for
    /// the transport to read into.
    pub fn reserve_window(&mut self) -> &mut [u8] {
        let want = self.pool.segment_capacity();
        let start = self.buf.len();
        self.buf.resize(start + want, 0);
        &mut self.buf[start..start + want]
    }

    /// Marks `n` bytes of the most recent [`reserve_window`] call as valid,
    /// dropping the unused remainder of the window.
    pub fn commit_rx(&mut self, n: usize) {
        let window = self.pool.segment_capacity();
        debug_assert!(n <= window);
        let start = self.buf.len() - window;
        self.buf.truncate(start + n);
    }

    /// Parses as many complete messages as the accumulator currently holds,
    /// compacting consumed bytes out of the buffer as it goes. A parse
    /// failure is a `ProtocolViolation` — fatal to the channel per §4.3.
    pub fn parse_ready(&mut self) -> Result<Vec<DecodedMessage>> {
        let mut out = Vec::new();
        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let header = MessageHeader::decode(&self.buf[..HEADER_LEN])?;
            let total = HEADER_LEN + header.payload_len as usize;
            if self.buf.len() < total {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let chunk = self.buf.split_to(header.payload_len as usize);

            if header.is_continuation() {
                let partial = self.in_progress.as_mut().ok_or_else(|| {
                    RelayError::new(
                        RetCode::ProtocolViolation,
                        "continuation header without a message in progress",
                    )
                })?;
                if partial.kind != header.kind {
                    return Err(RelayError::new(
                        RetCode::ProtocolViolation,
                        "continuation header kind does not match message in progress",
                    ));
                }
                partial.accumulated.extend_from_slice(&chunk);
            } else {
                if self.in_progress.is_some() {
                    return Err(RelayError::new(
                        RetCode::ProtocolViolation,
                        "new message started before the previous one reached its final chunk",
                    ));
                }
                if header.is_final() {
                    out.push(Self::finalize(header.kind, chunk.freeze())?);
                    continue;
                }
                self.in_progress = Some(PartialMessage {
                    kind: header.kind,
                    accumulated: BytesMut::from(&chunk[..]),
                });
                continue;
            }

            if header.is_final() {
                let partial = self.in_progress.take().expect("checked above");
                out.push(Self::finalize(partial.kind, partial.accumulated.freeze())?);
            }
        }
        Ok(out)
    }

    fn finalize(kind: MessageKind, body: Bytes) -> Result<DecodedMessage> {
        let (call_id, sequence, body) = decode_preamble(kind, body)?;
        Ok(DecodedMessage {
            kind,
            call_id,
            sequence,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_preamble, CallId, HeaderFlags};

    fn frame(kind: MessageKind, flags: HeaderFlags, call_id: CallId, body: &[u8]) -> BytesMut {
        let mut preamble = BytesMut::new();
        encode_preamble(&mut preamble, kind, call_id, None);
        preamble.extend_from_slice(body);
        let header = MessageHeader::new(preamble.len() as u32, kind, flags);
        let mut out = BytesMut::new();
        header.encode(&mut out);
        out.extend_from_slice(&preamble);
        out
    }

    fn feed(rx: &mut RxBuffer, bytes: &[u8]) {
        let window = rx.reserve_window();
        window[..bytes.len()].copy_from_slice(bytes);
        let extra = window.len() - bytes.len();
        rx.commit_rx(bytes.len());
        let _ = extra;
    }

    #[test]
    fn single_frame_parses_immediately() {
        let mut rx = RxBuffer::new(SegmentPool::new(256));
        let f = frame(MessageKind::Request, HeaderFlags::FINAL, CallId::new(9), b"ping");
        feed(&mut rx, &f);
        let msgs = rx.parse_ready().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].call_id, Some(CallId::new(9)));
        assert_eq!(&msgs[0].body[..], b"ping");
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let mut rx = RxBuffer::new(SegmentPool::new(256));
        let f = frame(MessageKind::Request, HeaderFlags::FINAL, CallId::new(1), b"hello");
        feed(&mut rx, &f[..HEADER_LEN - 1]);
        assert!(rx.parse_ready().unwrap().is_empty());
        feed(&mut rx, &f[HEADER_LEN - 1..]);
        let msgs = rx.parse_ready().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].body[..], b"hello");
    }

    #[test]
    fn continuation_chunks_are_joined() {
        let mut rx = RxBuffer::new(SegmentPool::new(256));
        let call_id = CallId::new(5);
        let mut preamble = BytesMut::new();
        encode_preamble(&mut preamble, MessageKind::Request, call_id, None);
        preamble.extend_from_slice(b"AAAA");
        let first_header = MessageHeader::new(preamble.len() as u32, MessageKind::Request, HeaderFlags::NONE);
        let mut first = BytesMut::new();
        first_header.encode(&mut first);
        first.extend_from_slice(&preamble);

        let second_header = MessageHeader::new(4, MessageKind::Request, HeaderFlags::CONTINUATION | HeaderFlags::FINAL);
        let mut second = BytesMut::new();
        second_header.encode(&mut second);
        second.extend_from_slice(b"BBBB");

        feed(&mut rx, &first);
        assert!(rx.parse_ready().unwrap().is_empty());
        feed(&mut rx, &second);
        let msgs = rx.parse_ready().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(&msgs[0].body[..], b"AAAABBBB");
    }

    #[test]
    fn unknown_continuation_is_protocol_violation() {
        let mut rx = RxBuffer::new(SegmentPool::new(256));
        let header = MessageHeader::new(0, MessageKind::Request, HeaderFlags::CONTINUATION | HeaderFlags::FINAL);
        let mut bytes = BytesMut::new();
        header.encode(&mut bytes);
        feed(&mut rx, &bytes);
        let err = rx.parse_ready().unwrap_err();
        assert_eq!(err.code(), RetCode::ProtocolViolation);
    }
}
