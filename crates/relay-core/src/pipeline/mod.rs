//! The Tx/Rx pipeline tasks (components D and E) that move framed bytes
//! between the buffers and the transport.

mod rx;
mod tx;

pub use rx::run_rx_pipeline;
pub use tx::run_tx_pipeline;
