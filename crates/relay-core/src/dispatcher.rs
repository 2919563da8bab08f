//! MessageDispatcher (component F): correlates outbound calls with the
//! inbound messages that answer them, and feeds paging stream pages/acks
//! through to whichever stream reader/writer registered for that call.
//!
//! Modeled on the `DashMap`-keyed registries elsewhere in the corpus (e.g.
//! the Call-ID-indexed session table in a SIP switch): one concurrent map
//! from [`CallId`] to the pending [`Operation`], entries inserted by the
//! caller before the request goes out and removed once the call settles.
//!
//! Inbound `Request`/`OneWay` frames — a peer calling *us* — are not routed
//! through this map at all: correlating our own outstanding calls is this
//! component's whole job, and delivering inbound calls to a registered
//! service handler is out of scope for this core (see crate docs).

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::{ChannelConfig, DispatcherMode};
use crate::error::{RelayError, RetCode, Result};
use crate::wire::{CallId, DecodedMessage, MessageKind};

/// What's waiting on a given [`CallId`]: a single unary response, or a
/// channel feeding an open paging stream.
enum Operation {
    Unary(oneshot::Sender<Result<DecodedMessage>>),
    Stream(mpsc::Sender<Result<DecodedMessage>>),
}

/// Capacity slack added on top of the stream window for the per-call
/// delivery channel. Actual backpressure is enforced by the paging
/// protocol's ack/credit exchange, not by this channel filling up, so the
/// slack only needs to absorb scheduling jitter between dispatcher and
/// reader.
const STREAM_CHANNEL_SLACK: usize = 4;

enum DeliveryAction {
    Unary(oneshot::Sender<Result<DecodedMessage>>),
    Stream(mpsc::Sender<Result<DecodedMessage>>),
}

pub struct MessageDispatcher {
    operations: DashMap<CallId, Operation>,
    mode: DispatcherMode,
    inbound: Option<mpsc::Sender<DecodedMessage>>,
}

impl MessageDispatcher {
    /// Builds a dispatcher for the given configuration. In `PagedQueueX1`
    /// mode, also spawns the single worker task that drains the internal
    /// queue and delivers messages in arrival order; `on_message` in that
    /// mode just enqueues and returns, decoupling the Rx read loop from
    /// however slow an individual call's consumer is.
    pub fn new(config: &ChannelConfig) -> Arc<Self> {
        match config.dispatcher_mode {
            DispatcherMode::NoQueue => Arc::new(Self {
                operations: DashMap::new(),
                mode: DispatcherMode::NoQueue,
                inbound: None,
            }),
            DispatcherMode::PagedQueueX1 => {
                let (tx, mut rx) = mpsc::channel(config.dispatcher_queue_capacity);
                let dispatcher = Arc::new(Self {
                    operations: DashMap::new(),
                    mode: DispatcherMode::PagedQueueX1,
                    inbound: Some(tx),
                });
                let worker = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        worker.deliver(message).await;
                    }
                });
                dispatcher
            }
        }
    }

    /// Registers a waiter for a single request/response call. The caller
    /// must insert this *before* sending the request, so a same-tick
    /// response can never race the registration.
    pub fn register_unary(&self, call_id: CallId) -> oneshot::Receiver<Result<DecodedMessage>> {
        let (tx, rx) = oneshot::channel();
        self.operations.insert(call_id, Operation::Unary(tx));
        rx
    }

    /// Registers a paging stream's delivery channel for `call_id`. The
    /// channel stays registered (pages/acks keep flowing through it) until
    /// a `StreamCompletion` or `Fault` arrives, or [`Self::unregister`] is
    /// called explicitly.
    pub fn register_stream(&self, call_id: CallId, window: usize) -> mpsc::Receiver<Result<DecodedMessage>> {
        let (tx, rx) = mpsc::channel(window.max(1) + STREAM_CHANNEL_SLACK);
        self.operations.insert(call_id, Operation::Stream(tx));
        rx
    }

    /// Removes a call's registration, e.g. once a unary response arrived or
    /// a stream reached its terminal state.
    pub fn unregister(&self, call_id: CallId) {
        self.operations.remove(&call_id);
    }

    /// Hands an inbound, already-reassembled message to the dispatcher.
    /// Unrecognized `call_id`s are logged and swallowed rather than
    /// propagated, since a peer's stray or already-settled-call frame
    /// should not fault an otherwise healthy channel.
    pub async fn on_message(&self, message: DecodedMessage) -> Result<()> {
        if !message.kind.carries_call_id() {
            return Err(RelayError::new(
                RetCode::ProtocolViolation,
                "login/logout frames must not be routed through the dispatcher",
            ));
        }
        match self.mode {
            DispatcherMode::NoQueue => {
                self.deliver(message).await;
                Ok(())
            }
            DispatcherMode::PagedQueueX1 => {
                let sender = self
                    .inbound
                    .as_ref()
                    .expect("PagedQueueX1 dispatcher always has an inbound sender");
                sender.send(message).await.map_err(|_| {
                    RelayError::new(RetCode::ChannelClosed, "dispatcher worker task is gone")
                })
            }
        }
    }

    async fn deliver(&self, message: DecodedMessage) {
        let Some(call_id) = message.call_id else {
            warn!(kind = ?message.kind, "message missing CallId reached the dispatcher");
            return;
        };

        let action = match self.operations.entry(call_id) {
            Entry::Vacant(_) => None,
            Entry::Occupied(entry) => match entry.get() {
                Operation::Unary(_) => match entry.remove() {
                    Operation::Unary(tx) => Some(DeliveryAction::Unary(tx)),
                    Operation::Stream(_) => unreachable!("checked above"),
                },
                Operation::Stream(sender) => {
                    let sender = sender.clone();
                    let terminal = matches!(
                        message.kind,
                        MessageKind::StreamCompletion | MessageKind::Fault
                    );
                    if terminal {
                        entry.remove();
                    }
                    Some(DeliveryAction::Stream(sender))
                }
            },
        };

        let Some(action) = action else {
            warn!(
                code = %RetCode::ProtocolViolation,
                %call_id,
                kind = ?message.kind,
                "no operation registered for this call_id; dropping frame"
            );
            return;
        };

        match action {
            DeliveryAction::Unary(waiter) => {
                let result = Self::unary_result(message);
                let _ = waiter.send(result);
            }
            DeliveryAction::Stream(sender) => {
                let result = Self::unary_result(message);
                if sender.send(result).await.is_err() {
                    warn!(%call_id, "stream reader dropped before delivery completed");
                }
            }
        }
    }

    fn unary_result(message: DecodedMessage) -> Result<DecodedMessage> {
        match message.kind {
            MessageKind::Fault => Err(RelayError::new(
                RetCode::RequestFault,
                "peer reported a fault for this call",
            )),
            _ => Ok(message),
        }
    }

    /// Fails every outstanding call with `fault`, used when the channel
    /// transitions to `Faulted`. Stream senders are simply dropped, closing
    /// the reader's channel; the reader surfaces that as the same fault via
    /// [`crate::channel::Channel::fault`].
    pub fn stop(&self, fault: RelayError) {
        let call_ids: Vec<CallId> = self.operations.iter().map(|entry| *entry.key()).collect();
        for call_id in call_ids {
            if let Some((_, operation)) = self.operations.remove(&call_id) {
                match operation {
                    Operation::Unary(waiter) => {
                        let _ = waiter.send(Err(fault.clone()));
                    }
                    Operation::Stream(sender) => drop(sender),
                }
            }
        }
    }

    pub fn pending_calls(&self) -> usize {
        self.operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfigBuilder;
    use crate::wire::CallId;

    fn decoded(kind: MessageKind, call_id: CallId) -> DecodedMessage {
        DecodedMessage {
            kind,
            call_id: Some(call_id),
            sequence: None,
            body: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn unary_call_resolves_on_response() {
        let config = ChannelConfigBuilder::new()
            .dispatcher_mode(DispatcherMode::NoQueue)
            .build()
            .unwrap();
        let dispatcher = MessageDispatcher::new(&config);
        let call_id = CallId::new(1);
        let rx = dispatcher.register_unary(call_id);
        dispatcher
            .on_message(decoded(MessageKind::Response, call_id))
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn fault_response_surfaces_as_request_fault() {
        let config = ChannelConfigBuilder::new().build().unwrap();
        let dispatcher = MessageDispatcher::new(&config);
        let call_id = CallId::new(2);
        let rx = dispatcher.register_unary(call_id);
        dispatcher
            .on_message(decoded(MessageKind::Fault, call_id))
            .await
            .unwrap();
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap_err().code(), RetCode::RequestFault);
    }

    #[tokio::test]
    async fn unknown_call_id_is_swallowed_not_propagated() {
        let config = ChannelConfigBuilder::new()
            .dispatcher_mode(DispatcherMode::NoQueue)
            .build()
            .unwrap();
        let dispatcher = MessageDispatcher::new(&config);
        let result = dispatcher
            .on_message(decoded(MessageKind::StreamPage, CallId::new(999)))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stream_completion_unregisters_the_call() {
        let config = ChannelConfigBuilder::new()
            .dispatcher_mode(DispatcherMode::NoQueue)
            .build()
            .unwrap();
        let dispatcher = MessageDispatcher::new(&config);
        let call_id = CallId::new(3);
        let mut rx = dispatcher.register_stream(call_id, 2);
        dispatcher
            .on_message(decoded(MessageKind::StreamPage, call_id))
            .await
            .unwrap();
        dispatcher
            .on_message(decoded(MessageKind::StreamCompletion, call_id))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_ok());
        assert_eq!(dispatcher.pending_calls(), 0);
    }

    #[tokio::test]
    async fn stop_fails_every_outstanding_waiter() {
        let config = ChannelConfigBuilder::new()
            .dispatcher_mode(DispatcherMode::NoQueue)
            .build()
            .unwrap();
        let dispatcher = MessageDispatcher::new(&config);
        let rx1 = dispatcher.register_unary(CallId::new(10));
        let rx2 = dispatcher.register_unary(CallId::new(11));
        dispatcher.stop(RelayError::new(RetCode::ConnectionAbortedByPeer, "peer vanished"));
        assert_eq!(rx1.await.unwrap().unwrap_err().code(), RetCode::ConnectionAbortedByPeer);
        assert_eq!(rx2.await.unwrap().unwrap_err().code(), RetCode::ConnectionAbortedByPeer);
    }
}
