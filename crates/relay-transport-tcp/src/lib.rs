#![doc = r#"
relay-transport-tcp: the `Transport` adapter over `tokio::net::TcpStream`.

## Scope

Connects/accepts plain TCP sockets and wraps them as `relay_core::Transport`
([`stream::TcpTransport`]), plus a minimal [`listener::TcpListener`] for the
accepting side. With the `tls` feature enabled, [`tls::connect_tls`] and
[`tls::accept_tls`] perform a `tokio-rustls` handshake over an otherwise
identical connected socket and hand back the same `Transport` surface —
negotiating the handshake itself (certificates, cipher suites) is entirely
`tokio-rustls`'s concern, not reimplemented here.

Everything past the connected socket — framing, dispatch, the login
handshake, paged streams — is `relay-core`'s job; this crate only answers
"how do bytes get to and from the wire".

## Error handling

I/O failures are mapped through [`error::map_io_error`] onto `relay-core`'s
`RetCode` taxonomy, so a caller driving a `Channel` never needs to match on
`std::io::ErrorKind` directly.
"#]

pub mod error;
pub mod listener;
pub mod stream;

#[cfg(feature = "tls")]
pub mod tls;

pub use listener::TcpListener;
pub use stream::TcpTransport;
