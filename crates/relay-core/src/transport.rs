//! The byte-stream transport contract (component M) that a [`crate::channel::Channel`]
//! drives. Deliberately narrower than a full multi-protocol abstraction:
//! just `send`/`receive`/`shutdown`/`dispose` on an already-established
//! connection. Negotiating that connection (TLS handshake, TCP accept loop)
//! is out of scope here and lives in adapter crates such as
//! `relay-transport-tcp`.

use async_trait::async_trait;

use crate::error::Result;

/// Which half of a full-duplex connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Write,
    Read,
    Both,
}

/// An established, full-duplex byte-stream connection.
///
/// Implementations serialize concurrent callers internally (the teacher's
/// TCP adapter does this with an async mutex around the socket); callers
/// here are expected to be the single Tx drain loop and single Rx read
/// loop, so no further synchronization is required above this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes `buf` in full, looping over partial writes as needed.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Reads at least one byte into `buf`, returning the number of bytes
    /// read. `Ok(0)` means the peer closed its write half (EOF); the
    /// caller maps that to `ChannelClosedByOtherSide`.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize>;

    /// Half- or fully closes the connection.
    async fn shutdown(&self, direction: ShutdownDirection) -> Result<()>;

    /// Releases any transport-owned resources. Called once, after the
    /// channel has finished its own shutdown sequence.
    async fn dispose(&self);
}
