//! Paging stream writer/reader (component G): a bounded-memory,
//! ack-windowed way to move long sequences of bytes over a call without
//! buffering the whole thing in memory on either end.

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::StreamWriter;
