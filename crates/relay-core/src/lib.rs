#![doc = r#"
relay-core: connection core for a channel/stream RPC framework.

## Scope

This crate owns one connection's lifecycle from handshake to close: wire
framing ([`wire`]), the Tx/Rx buffers and pipelines ([`buffer`],
[`pipeline`]), call correlation ([`dispatcher`]), paged byte streams
([`stream`]), the login/logout handshake ([`coordinator`]), and the
[`channel::Channel`] state machine that ties all of it together.

It does not know how bytes reach the wire (that's [`Transport`], implemented
by an adapter crate such as `relay-transport-tcp`), how request/response
bodies are serialized (every payload past the wire preamble is an opaque
`&[u8]`/`Bytes`), or how a service routes an inbound call to a handler —
those are all external collaborators by design.

## Error handling

Every fallible operation returns [`Result<T>`](error::Result), an alias for
`std::result::Result<T, RelayError>`. [`RelayError`] wraps a single flat
[`RetCode`] taxonomy rather than a per-component error type, so a dispatcher
waiter, a stream writer, and a channel can all fail with the same kind of
value.

## Logging

Structured, level-scoped `tracing` events at the natural seams: pipeline
start/stop, fault transitions, protocol violations. No metrics/otel exporter
is part of this crate's contract.
"#]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod transport;
pub mod wire;

pub mod test_support;

pub use channel::{Channel, ChannelState};
pub use config::{ChannelConfig, ChannelConfigBuilder, DispatcherMode};
pub use coordinator::{LoginOutcome, LoginValidator, SessionCoordinator};
pub use dispatcher::MessageDispatcher;
pub use error::{RelayError, RetCode, Result};
pub use stream::{StreamReader, StreamWriter};
pub use transport::{ShutdownDirection, Transport};
pub use wire::{CallId, CallIdSeed};
