//! Maps `std::io::Error` onto this workspace's flat [`RetCode`] domain.
//!
//! Mirrors the teacher's `map_io_error`/`categorize_io_error` pair (one
//! function classifying an `io::ErrorKind` into a stable outcome, one
//! wrapping it with an operation-specific message) but targets `RelayError`
//! instead of a category-tagged `CoreError`, since this workspace has no
//! retry-advice concept to attach.

use std::io;

use relay_core::error::{RelayError, RetCode};

/// Classifies `error` and wraps it as a [`RelayError`] with `context`
/// (e.g. `"tcp connect"`, `"tcp read"`) as the message prefix.
pub fn map_io_error(context: &'static str, error: io::Error) -> RelayError {
    let code = categorize(&error);
    RelayError::new(code, format!("{context}: {error}")).with_cause(error)
}

fn categorize(error: &io::Error) -> RetCode {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::ConnectionRefused => RetCode::ConnectionRefused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            RetCode::ConnectionAbortedByPeer
        }
        ErrorKind::TimedOut => RetCode::ConnectionTimeout,
        ErrorKind::NotConnected | ErrorKind::AddrNotAvailable | ErrorKind::AddrInUse => {
            RetCode::OtherConnectionError
        }
        _ => RetCode::OtherConnectionError,
    }
}
