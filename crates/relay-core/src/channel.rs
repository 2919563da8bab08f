//! Channel (component I): the top-level state machine that owns a
//! connection's buffers, pipelines, dispatcher and coordinator, and walks
//! through `New -> Connecting -> Online -> Disconnecting -> Closed`, with
//! a side transition to `Faulted` reachable from anywhere once a fatal
//! error is observed.
//!
//! Grounded on the same "single shared `Arc<Inner>`, state behind a lock,
//! background tasks hold weak/strong references back into it" shape used
//! throughout the corpus's connection objects (e.g. the teacher's
//! `TcpChannelInner` holding an `AsyncMutex<TcpStream>` plus auxiliary
//! state next to it), generalized here to own the whole connection-core
//! stack rather than a single socket.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{RxBuffer, SegmentPool, TxBuffer};
use crate::config::ChannelConfig;
use crate::coordinator::SessionCoordinator;
use crate::dispatcher::MessageDispatcher;
use crate::error::{RelayError, RetCode, Result};
use crate::pipeline::{run_rx_pipeline, run_tx_pipeline};
use crate::stream::{StreamReader, StreamWriter};
use crate::transport::{ShutdownDirection, Transport};
use crate::wire::{encode_preamble, CallId, CallIdSeed, MessageKind};

/// Lifecycle state. `Faulted` is terminal just like `Closed`, but records
/// why the channel stopped instead of how it was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Online,
    Disconnecting,
    Closed,
    Faulted,
}

/// The first fault observed on a channel. `RetCode` comparisons aren't
/// ordered by severity; "first wins" just means the first call to
/// [`Fault::set`] sticks and every later one is ignored, so every waiter
/// that gets woken by the fault path sees the same, earliest cause.
#[derive(Default)]
struct Fault(Mutex<Option<RelayError>>);

impl Fault {
    fn set(&self, error: RelayError) -> RelayError {
        let mut guard = self.0.lock();
        if guard.is_none() {
            *guard = Some(error.clone());
        }
        guard.clone().unwrap_or(error)
    }

    fn get(&self) -> Option<RelayError> {
        self.0.lock().clone()
    }
}

struct Tasks {
    tx: Option<JoinHandle<()>>,
    rx: Option<JoinHandle<()>>,
}

pub struct Channel {
    config: Arc<ChannelConfig>,
    transport: Arc<dyn Transport>,
    tx: Arc<TxBuffer>,
    dispatcher: Arc<MessageDispatcher>,
    coordinator: Arc<SessionCoordinator>,
    call_ids: CallIdSeed,
    state: Mutex<ChannelState>,
    fault: Fault,
    tasks: Mutex<Tasks>,
    /// Caches `close_graceful`'s outcome so reentrant/concurrent callers
    /// await the one real close instead of each running the shutdown
    /// sequence (logout, drain, transport shutdown) a second time.
    close_once: tokio::sync::OnceCell<Result<()>>,
    /// Guards `Transport::dispose`, which the trait documents as callable
    /// only once: both the graceful-close path and the fault path
    /// (`fail()`) route their disposal through this so whichever one gets
    /// there first is the one that actually runs it.
    dispose_once: tokio::sync::OnceCell<()>,
}

impl Channel {
    /// Builds a channel around an already-connected `transport`. The
    /// caller still needs to call [`Channel::start`] to spin up the
    /// pipelines and [`Channel::login`] to complete the handshake before
    /// issuing calls.
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ChannelConfig>) -> Arc<Self> {
        let tx_pool = SegmentPool::new(config.tx_segment_size);
        let tx = Arc::new(TxBuffer::new(tx_pool));
        let dispatcher = MessageDispatcher::new(&config);
        let coordinator = Arc::new(SessionCoordinator::new(Arc::clone(&tx)));

        Arc::new(Self {
            config,
            transport,
            tx,
            dispatcher,
            coordinator,
            call_ids: CallIdSeed::new(),
            state: Mutex::new(ChannelState::New),
            fault: Fault::default(),
            tasks: Mutex::new(Tasks { tx: None, rx: None }),
            close_once: tokio::sync::OnceCell::new(),
            dispose_once: tokio::sync::OnceCell::new(),
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn fault(&self) -> Option<RelayError> {
        self.fault.get()
    }

    /// Spawns the Tx and Rx pipeline tasks and moves to `Connecting`. Each
    /// task's failure is routed through [`Self::on_communication_error`],
    /// so a single dropped connection only needs to be detected once.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::New {
                return;
            }
            *state = ChannelState::Connecting;
        }
        debug!("channel opening");

        let rx_pool = SegmentPool::new(self.config.rx_segment_size);
        let rx_buffer = RxBuffer::new(rx_pool);

        let tx_handle = {
            let channel = Arc::clone(self);
            tokio::spawn(async move {
                let result = run_tx_pipeline(
                    Arc::clone(&channel.tx),
                    Arc::clone(&channel.transport),
                    channel.config.tx_pipeline_grace_period,
                )
                .await;
                if let Err(err) = result {
                    channel.on_communication_error(err).await;
                }
            })
        };

        let rx_handle = {
            let channel = Arc::clone(self);
            tokio::spawn(async move {
                let result = run_rx_pipeline(
                    rx_buffer,
                    Arc::clone(&channel.transport),
                    Arc::clone(&channel.dispatcher),
                    Arc::clone(&channel.coordinator),
                )
                .await;
                match result {
                    Ok(()) => channel.on_peer_closed().await,
                    Err(err) => channel.on_communication_error(err).await,
                }
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.tx = Some(tx_handle);
        tasks.rx = Some(rx_handle);
    }

    /// Completes the login handshake, transitioning to `Online` on
    /// success or `Faulted` on a timeout/rejection.
    pub async fn login(self: &Arc<Self>, credentials: &[u8]) -> Result<()> {
        match self.coordinator.login(credentials, self.config.login_timeout).await {
            Ok(()) => {
                *self.state.lock() = ChannelState::Online;
                info!("channel online");
                Ok(())
            }
            Err(err) => {
                let fault = self.fail(err.clone()).await;
                Err(fault)
            }
        }
    }

    /// Issues a unary request and awaits its response/fault.
    pub async fn call(self: &Arc<Self>, simple_encoding: bool, payload: &[u8]) -> Result<bytes::Bytes> {
        self.call_inner(simple_encoding, payload, None).await
    }

    /// Same as [`Self::call`], but resolves early with `OperationCanceled`
    /// if `cancel` fires before a response arrives. The call stays
    /// registered with the dispatcher; an eventual late response or fault
    /// is simply dropped once nobody is polling this future anymore.
    pub async fn call_cancellable(
        self: &Arc<Self>,
        simple_encoding: bool,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<bytes::Bytes> {
        self.call_inner(simple_encoding, payload, Some(cancel)).await
    }

    async fn call_inner(
        self: &Arc<Self>,
        simple_encoding: bool,
        payload: &[u8],
        cancel: Option<&CancellationToken>,
    ) -> Result<bytes::Bytes> {
        self.ensure_online()?;
        let call_id = self.call_ids.next_id();
        let mut rx = self.dispatcher.register_unary(call_id);

        let mut frame = bytes::BytesMut::new();
        encode_preamble(&mut frame, MessageKind::Request, call_id, None);
        frame.extend_from_slice(payload);
        if let Err(err) = self.tx.write_message(MessageKind::Request, simple_encoding, &frame) {
            self.dispatcher.unregister(call_id);
            return Err(err);
        }

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.dispatcher.unregister(call_id);
                        return Err(RelayError::new(
                            RetCode::OperationCanceled,
                            "call canceled before a response arrived",
                        ));
                    }
                    result = &mut rx => result,
                }
            }
            None => (&mut rx).await,
        };

        match outcome {
            Ok(result) => result.map(|message| message.body),
            Err(_) => Err(self.fault().unwrap_or_else(|| {
                RelayError::new(RetCode::ChannelClosed, "channel closed before a response arrived")
            })),
        }
    }

    /// Opens an outbound paging stream for `call_id`. Mirrors `call` in
    /// that the caller is responsible for also sending whatever initiating
    /// frame establishes the call on the peer; this just wires the local
    /// writer up to the dispatcher.
    pub fn open_stream_writer(self: &Arc<Self>) -> Result<(CallId, StreamWriter)> {
        self.open_stream_writer_with(None)
    }

    /// Same as [`Self::open_stream_writer`], but the returned writer
    /// resolves a blocked `write`/`finish` with `OperationCanceled` once
    /// `cancel` fires.
    pub fn open_stream_writer_cancellable(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Result<(CallId, StreamWriter)> {
        self.open_stream_writer_with(Some(cancel))
    }

    fn open_stream_writer_with(
        self: &Arc<Self>,
        cancel: Option<CancellationToken>,
    ) -> Result<(CallId, StreamWriter)> {
        self.ensure_online()?;
        let call_id = self.call_ids.next_id();
        let mut writer = StreamWriter::new(
            call_id,
            Arc::clone(&self.tx),
            &self.dispatcher,
            self.config.stream_page_size,
            self.config.stream_window,
        );
        if let Some(token) = cancel {
            writer = writer.with_cancel_token(token);
        }
        Ok((call_id, writer))
    }

    /// Registers a reader for an inbound paging stream already associated
    /// with `call_id` (e.g. one named in a prior response payload).
    pub fn open_stream_reader(self: &Arc<Self>, call_id: CallId) -> Result<StreamReader> {
        self.open_stream_reader_with(call_id, None)
    }

    /// Same as [`Self::open_stream_reader`], but the returned reader
    /// resolves a blocked `next_page`/`drain` with `OperationCanceled` once
    /// `cancel` fires.
    pub fn open_stream_reader_cancellable(
        self: &Arc<Self>,
        call_id: CallId,
        cancel: CancellationToken,
    ) -> Result<StreamReader> {
        self.open_stream_reader_with(call_id, Some(cancel))
    }

    fn open_stream_reader_with(
        self: &Arc<Self>,
        call_id: CallId,
        cancel: Option<CancellationToken>,
    ) -> Result<StreamReader> {
        self.ensure_online()?;
        let mut reader = StreamReader::new(call_id, Arc::clone(&self.tx), &self.dispatcher, self.config.stream_window);
        if let Some(token) = cancel {
            reader = reader.with_cancel_token(token);
        }
        Ok(reader)
    }

    /// Initiates graceful shutdown: logout, drain the `TxBuffer` down to the
    /// wire, then shut the write half down and give the Rx pipeline one
    /// grace period to notice before it is cut loose. A peer that never
    /// closes its own write half would otherwise hang this call forever —
    /// the same `tx_pipeline_grace_period` budget already used to bound the
    /// Tx drain bounds this wait too.
    ///
    /// Idempotent: the actual shutdown sequence only ever runs once per
    /// channel. A reentrant or concurrent caller awaits that same run and
    /// observes its exact result instead of starting a second logout.
    pub async fn close_graceful(self: &Arc<Self>) -> Result<()> {
        self.close_once.get_or_init(|| self.run_close_graceful()).await.clone()
    }

    async fn run_close_graceful(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::Closed | ChannelState::Faulted) {
                return Ok(());
            }
            *state = ChannelState::Disconnecting;
        }
        debug!("channel closing");

        let logout = self.coordinator.logout(self.config.logout_timeout).await;
        self.tx.close();
        self.join_tx_pipeline().await;
        self.transport.shutdown(ShutdownDirection::Write).await.ok();

        self.wait_for_rx_pipeline(self.config.tx_pipeline_grace_period).await;
        self.dispose_transport().await;

        *self.state.lock() = ChannelState::Closed;
        info!("channel closed");
        logout
    }

    /// Non-graceful abort: immediately faults every outstanding call and
    /// cuts the pipelines loose without waiting for either side to notice.
    pub async fn close_abort(self: &Arc<Self>, reason: RelayError) {
        self.fail(reason).await;
        self.abort_pipelines();
    }

    /// Disposes the transport exactly once, whichever of the graceful-close
    /// or fault path gets there first. `Transport::dispose` is documented
    /// as callable only once.
    async fn dispose_transport(&self) {
        self.dispose_once.get_or_init(|| self.transport.dispose()).await;
    }

    async fn join_tx_pipeline(&self) {
        let handle = self.tasks.lock().tx.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Waits up to `grace` for the Rx pipeline to stop on its own (the peer
    /// closing its write half in response to ours); aborts it otherwise so a
    /// silent peer can't hang a graceful close indefinitely.
    async fn wait_for_rx_pipeline(&self, grace: Duration) {
        let handle = self.tasks.lock().rx.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }

    fn abort_pipelines(&self) {
        let mut tasks = self.tasks.lock();
        if let Some(handle) = tasks.tx.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.rx.take() {
            handle.abort();
        }
    }

    async fn on_communication_error(self: &Arc<Self>, err: RelayError) {
        warn!(error = %err, "communication error, faulting channel");
        self.fail(err).await;
    }

    async fn on_peer_closed(self: &Arc<Self>) {
        debug!("peer closed the connection");
        self.fail(RelayError::new(
            RetCode::ChannelClosedByOtherSide,
            "peer closed its write half",
        ))
        .await;
    }

    /// Records `error` as the channel's fault (first one wins), fails
    /// every outstanding call, transitions to `Faulted`, and runs the same
    /// transport teardown (`OnCommunicationError` is `TriggerClose` with
    /// the error as reason, minus the logout step) a `close_graceful` would
    /// have run.
    async fn fail(self: &Arc<Self>, error: RelayError) -> RelayError {
        let fault = self.fault.set(error);
        {
            let mut state = self.state.lock();
            if !matches!(*state, ChannelState::Closed) {
                *state = ChannelState::Faulted;
            }
        }
        self.dispatcher.stop(fault.clone());
        self.tx.close();
        self.transport.shutdown(ShutdownDirection::Both).await.ok();
        self.dispose_transport().await;
        if fault.code() != RetCode::Ok {
            error!(code = %fault.code(), "channel faulted: {}", fault.message());
        }
        fault
    }

    fn ensure_online(&self) -> Result<()> {
        if let Some(fault) = self.fault() {
            return Err(fault);
        }
        match *self.state.lock() {
            ChannelState::Online => Ok(()),
            other => Err(RelayError::new(
                RetCode::InvalidChannelState,
                format!("channel is not online (state: {other:?})"),
            )),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of calls currently registered with the dispatcher, i.e. sent
    /// but not yet resolved or faulted.
    pub fn pending_calls(&self) -> usize {
        self.dispatcher.pending_calls()
    }
}
