//! Wire framing: the fixed-width [`MessageHeader`] and the small, fixed
//! preamble (kind + `CallId`) the dispatcher reads without touching the
//! rest of the payload. Everything past the preamble is serializer-defined
//! and opaque to this crate, per the component design in §4.3/§6.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{RelayError, RetCode, Result};

/// Fixed header width: `payload_len: u32` + `kind: u8` + `flags: u8` +
/// `reserved: u16`. Kept deliberately small and alignment-friendly so many
/// of them fit in a single segment alongside small payloads.
pub const HEADER_LEN: usize = 8;

/// Width of the `CallId` preamble that follows the header for every kind
/// that correlates to an outstanding call.
pub const CALL_ID_LEN: usize = 8;

/// Width of the stream sequence number that follows the `CallId` preamble
/// for `StreamPage` and `StreamAck` frames.
pub const SEQUENCE_LEN: usize = 4;

/// A stable, process-unique call identifier chosen by the initiator and
/// echoed back on every message related to that call. Modeled as a `u64`
/// rather than a string: the dispatcher and wire preamble both need a
/// fixed-width, cheaply comparable key, and a monotonic counter already
/// satisfies "globally unique" for the lifetime of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl CallId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Monotonic `CallId` generator. One instance per channel; never persisted,
/// per the design notes ("global id seed... any monotonic counter; no
/// persistence needed").
#[derive(Debug, Default)]
pub struct CallIdSeed {
    next: AtomicU64,
}

impl CallIdSeed {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> CallId {
        CallId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// The message kind, carried as a single byte in the header. Each frame has
/// exactly one kind; this intentionally is not a bitflag set since the
/// spec's "kind bits" only ever combine as a discriminant in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Fault = 2,
    StreamPage = 3,
    StreamAck = 4,
    StreamCompletion = 5,
    Login = 6,
    LoginResponse = 7,
    Logout = 8,
    LogoutResponse = 9,
    Cancel = 10,
    OneWay = 11,
}

impl MessageKind {
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0 => MessageKind::Request,
            1 => MessageKind::Response,
            2 => MessageKind::Fault,
            3 => MessageKind::StreamPage,
            4 => MessageKind::StreamAck,
            5 => MessageKind::StreamCompletion,
            6 => MessageKind::Login,
            7 => MessageKind::LoginResponse,
            8 => MessageKind::Logout,
            9 => MessageKind::LogoutResponse,
            10 => MessageKind::Cancel,
            11 => MessageKind::OneWay,
            other => {
                return Err(RelayError::new(
                    RetCode::ProtocolViolation,
                    format!("unknown message kind byte {other}"),
                ));
            }
        })
    }

    /// Whether frames of this kind carry a `CallId` preamble.
    pub fn carries_call_id(self) -> bool {
        !matches!(
            self,
            MessageKind::Login | MessageKind::LoginResponse | MessageKind::Logout | MessageKind::LogoutResponse
        )
    }

    /// Whether frames of this kind carry a sequence number after the
    /// `CallId` preamble (stream pages and acks only).
    pub fn carries_sequence(self) -> bool {
        matches!(self, MessageKind::StreamPage | MessageKind::StreamAck)
    }
}

/// Header flag bits. `CONTINUATION` marks a header whose payload extends a
/// previous chunk rather than starting a new message. `FINAL` marks the
/// last chunk of a (possibly multi-segment) message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const CONTINUATION: HeaderFlags = HeaderFlags(0b0000_0001);
    pub const FINAL: HeaderFlags = HeaderFlags(0b0000_0010);
    /// Set when the payload uses the caller's "simple" (non-negotiated)
    /// encoding mode, mirroring `TxBuffer::start_message`'s `simple_encoding`
    /// parameter in §4.2.
    pub const SIMPLE_ENCODING: HeaderFlags = HeaderFlags(0b0000_0100);
    pub const NONE: HeaderFlags = HeaderFlags(0);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        HeaderFlags(bits & (Self::CONTINUATION.0 | Self::FINAL.0 | Self::SIMPLE_ENCODING.0))
    }

    pub const fn contains(self, other: HeaderFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: HeaderFlags) -> HeaderFlags {
        HeaderFlags(self.0 | other.0)
    }
}

impl core::ops::BitOr for HeaderFlags {
    type Output = HeaderFlags;
    fn bitor(self, rhs: HeaderFlags) -> HeaderFlags {
        self.union(rhs)
    }
}

/// Fixed-width frame header, encoded/decoded without touching the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub payload_len: u32,
    pub kind: MessageKind,
    pub flags: HeaderFlags,
}

impl MessageHeader {
    pub fn new(payload_len: u32, kind: MessageKind, flags: HeaderFlags) -> Self {
        Self {
            payload_len,
            kind,
            flags,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.flags.contains(HeaderFlags::CONTINUATION)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(HeaderFlags::FINAL)
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u32_le(self.payload_len);
        out.put_u8(self.kind as u8);
        out.put_u8(self.flags.bits());
        out.put_u16_le(0); // reserved
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(RelayError::new(
                RetCode::ProtocolViolation,
                "header shorter than HEADER_LEN",
            ));
        }
        let mut cursor = buf;
        let payload_len = cursor.get_u32_le();
        let kind = MessageKind::from_u8(cursor.get_u8())?;
        let flags = HeaderFlags::from_bits_truncate(cursor.get_u8());
        let _reserved = cursor.get_u16_le();
        Ok(Self {
            payload_len,
            kind,
            flags,
        })
    }
}

/// Encodes the `CallId` (and, for stream frames, sequence number) preamble
/// into `out`, ahead of the serializer-defined body.
pub fn encode_preamble(out: &mut BytesMut, kind: MessageKind, call_id: CallId, sequence: Option<u32>) {
    if kind.carries_call_id() {
        out.put_u64_le(call_id.0);
    }
    if kind.carries_sequence() {
        out.put_u32_le(sequence.unwrap_or_default());
    }
}

/// Reads the preamble back out of a decoded payload, returning the
/// `CallId` (if any), the sequence number (if any), and the remaining body
/// bytes untouched.
pub fn decode_preamble(kind: MessageKind, mut payload: Bytes) -> Result<(Option<CallId>, Option<u32>, Bytes)> {
    let call_id = if kind.carries_call_id() {
        if payload.len() < CALL_ID_LEN {
            return Err(RelayError::new(
                RetCode::ProtocolViolation,
                "payload shorter than CallId preamble",
            ));
        }
        Some(CallId(payload.get_u64_le()))
    } else {
        None
    };
    let sequence = if kind.carries_sequence() {
        if payload.len() < SEQUENCE_LEN {
            return Err(RelayError::new(
                RetCode::ProtocolViolation,
                "payload shorter than sequence preamble",
            ));
        }
        Some(payload.get_u32_le())
    } else {
        None
    };
    Ok((call_id, sequence, payload))
}

/// A fully reassembled logical message: header-driven chunking has already
/// been joined, and the `CallId`/sequence preamble has already been peeled
/// off of `body`. This is what the parser hands to the dispatcher.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub kind: MessageKind,
    pub call_id: Option<CallId>,
    pub sequence: Option<u32>,
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = MessageHeader::new(1234, MessageKind::Request, HeaderFlags::FINAL);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_final());
        assert!(!decoded.is_continuation());
    }

    #[test]
    fn preamble_round_trips_for_stream_page() {
        let call_id = CallId::new(42);
        let mut buf = BytesMut::new();
        encode_preamble(&mut buf, MessageKind::StreamPage, call_id, Some(7));
        buf.extend_from_slice(b"payload");
        let (decoded_id, seq, body) =
            decode_preamble(MessageKind::StreamPage, buf.freeze()).unwrap();
        assert_eq!(decoded_id, Some(call_id));
        assert_eq!(seq, Some(7));
        assert_eq!(&body[..], b"payload");
    }

    #[test]
    fn login_frames_have_no_call_id_preamble() {
        let mut buf = BytesMut::new();
        encode_preamble(&mut buf, MessageKind::Login, CallId::new(1), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn call_id_seed_is_monotonic_and_unique() {
        let seed = CallIdSeed::new();
        let a = seed.next_id();
        let b = seed.next_id();
        assert_ne!(a, b);
        assert!(b.0 > a.0);
    }
}
