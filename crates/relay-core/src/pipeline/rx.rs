//! RxPipeline (component E): reads bytes off the [`Transport`] into an
//! [`RxBuffer`], parses whatever complete messages are now available, and
//! routes each one to the [`MessageDispatcher`] (call traffic) or the
//! [`SessionCoordinator`] (login/logout traffic).

use std::sync::Arc;

use tracing::debug;

use crate::buffer::RxBuffer;
use crate::coordinator::SessionCoordinator;
use crate::dispatcher::MessageDispatcher;
use crate::error::Result;
use crate::transport::Transport;
use crate::wire::MessageKind;

/// Reads and dispatches until the transport reports EOF (`Ok(0)`) or a
/// fatal error. Returns `Ok(())` on a clean peer-initiated close,
/// propagating transport and parse errors as `Err` for the caller (the
/// channel's fault path) to react to.
pub async fn run_rx_pipeline(
    mut rx: RxBuffer,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<MessageDispatcher>,
    coordinator: Arc<SessionCoordinator>,
) -> Result<()> {
    loop {
        let n = transport.receive(rx.reserve_window()).await?;
        rx.commit_rx(n);

        if n == 0 {
            debug!("rx pipeline observed EOF, stopping");
            return Ok(());
        }

        for message in rx.parse_ready()? {
            if !message.kind.carries_call_id() {
                coordinator.on_message(message).await?;
                continue;
            }
            if matches!(message.kind, MessageKind::Request | MessageKind::OneWay) {
                // Inbound calls initiated by the peer are out of scope for
                // this core: there is no registered service handler to hand
                // them to, so they are logged and dropped.
                debug!(kind = ?message.kind, call_id = ?message.call_id, "inbound call ignored: no service handler registered");
                continue;
            }
            dispatcher.on_message(message).await?;
        }
    }
}
