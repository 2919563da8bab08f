//! Stable error domain shared by every component in this crate.
//!
//! `RetCode` is the single enum described in the error handling design: one
//! flat taxonomy rather than a per-component error type, so a dispatcher
//! waiter, a stream writer, and a channel can all fail with the same kind of
//! value and a caller never needs to match on "which layer produced this".

use std::borrow::Cow;
use std::fmt;

/// The stable, cross-component error code. `Ok` is never constructed as part
/// of a [`RelayError`] — it exists only so [`RetCode`] can double as the
/// "first fault wins" sentinel stored on a channel (`Fault::code` starts at
/// `Ok` and is monotonic from then on, see [`crate::channel::Fault`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetCode {
    Ok,
    ProtocolViolation,
    InvalidChannelState,
    InvalidCredentials,
    ChannelClosed,
    ChannelClosedByOtherSide,
    ConnectionShutdown,
    ConnectionAbortedByPeer,
    ConnectionTimeout,
    LoginTimeout,
    LogoutTimeout,
    SecurityError,
    SerializationError,
    DeserializationError,
    UnexpectedMessage,
    OperationCanceled,
    RequestFault,
    RequestCrash,
    MessageHandlerCrash,
    EventHandlerCrash,
    InitHandlerCrash,
    StreamCompleted,
    HostNotFound,
    HostUnreachable,
    ConnectionRefused,
    OtherConnectionError,
    OtherError,
    UnknownError,
}

impl RetCode {
    /// `true` for every variant except `Ok`. Used by [`crate::channel::Fault`]
    /// to decide whether a code is eligible to become (or replace) the fault.
    pub fn is_fault(self) -> bool {
        !matches!(self, RetCode::Ok)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RetCode::Ok => "ok",
            RetCode::ProtocolViolation => "protocol_violation",
            RetCode::InvalidChannelState => "invalid_channel_state",
            RetCode::InvalidCredentials => "invalid_credentials",
            RetCode::ChannelClosed => "channel_closed",
            RetCode::ChannelClosedByOtherSide => "channel_closed_by_other_side",
            RetCode::ConnectionShutdown => "connection_shutdown",
            RetCode::ConnectionAbortedByPeer => "connection_aborted_by_peer",
            RetCode::ConnectionTimeout => "connection_timeout",
            RetCode::LoginTimeout => "login_timeout",
            RetCode::LogoutTimeout => "logout_timeout",
            RetCode::SecurityError => "security_error",
            RetCode::SerializationError => "serialization_error",
            RetCode::DeserializationError => "deserialization_error",
            RetCode::UnexpectedMessage => "unexpected_message",
            RetCode::OperationCanceled => "operation_canceled",
            RetCode::RequestFault => "request_fault",
            RetCode::RequestCrash => "request_crash",
            RetCode::MessageHandlerCrash => "message_handler_crash",
            RetCode::EventHandlerCrash => "event_handler_crash",
            RetCode::InitHandlerCrash => "init_handler_crash",
            RetCode::StreamCompleted => "stream_completed",
            RetCode::HostNotFound => "host_not_found",
            RetCode::HostUnreachable => "host_unreachable",
            RetCode::ConnectionRefused => "connection_refused",
            RetCode::OtherConnectionError => "other_connection_error",
            RetCode::OtherError => "other_error",
            RetCode::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type threaded through every fallible operation in this crate:
/// a stable [`RetCode`], a human-readable message, and an optional source
/// error for chaining (transport I/O errors, serializer failures, ...).
///
/// Mirrors the teacher's `CoreError` shape (code + message + boxed cause)
/// but specialized to this crate's flat `RetCode` domain instead of a
/// string-namespaced code space, since this crate has no need for
/// cross-service code registries.
pub struct RelayError {
    code: RetCode,
    message: Cow<'static, str>,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl RelayError {
    pub fn new(code: RetCode, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn code(&self) -> RetCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|c| c.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Clone for RelayError {
    /// Faults get cloned into every outstanding waiter when a channel closes,
    /// so `RelayError` must be `Clone`; the source error is flattened to its
    /// `Display` string because `dyn Error` isn't `Clone`.
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            cause: self
                .cause
                .as_ref()
                .map(|c| Box::new(ClonedCause(c.to_string())) as _),
        }
    }
}

#[derive(Debug)]
struct ClonedCause(String);

impl fmt::Display for ClonedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ClonedCause {}

pub type Result<T> = core::result::Result<T, RelayError>;
