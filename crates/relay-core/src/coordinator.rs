//! SessionCoordinator (component H): drives the login/logout handshake
//! that brackets a channel's useful lifetime. Unlike [`crate::dispatcher::MessageDispatcher`],
//! which correlates many concurrent calls by `CallId`, login and logout
//! never overlap on a single channel, so a coordinator only ever has at
//! most one outstanding waiter of each kind — a pair of single-slot
//! `oneshot` registrations is enough, no map required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::buffer::TxBuffer;
use crate::error::{RelayError, RetCode, Result};
use crate::wire::{DecodedMessage, MessageKind};

/// The outcome of a peer's login attempt, reported back over the wire as a
/// `LoginResponse`. Encoded as a single leading byte (0 = accepted, 1 =
/// rejected) followed by a UTF-8 detail message — this crate's only wire
/// format invented outside the opaque-body convention, since accept/reject
/// plus a reason is the minimum a login handshake needs and there is no
/// external contract descriptor (out of scope, see crate docs) to lean on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted,
    Rejected(String),
}

impl LoginOutcome {
    fn encode(&self) -> Vec<u8> {
        match self {
            LoginOutcome::Accepted => vec![0u8],
            LoginOutcome::Rejected(reason) => {
                let mut buf = Vec::with_capacity(1 + reason.len());
                buf.push(1u8);
                buf.extend_from_slice(reason.as_bytes());
                buf
            }
        }
    }

    fn decode(body: &[u8]) -> Result<Self> {
        match body.first() {
            Some(0) => Ok(LoginOutcome::Accepted),
            Some(1) => Ok(LoginOutcome::Rejected(
                String::from_utf8_lossy(&body[1..]).into_owned(),
            )),
            _ => Err(RelayError::new(
                RetCode::ProtocolViolation,
                "malformed LoginResponse body",
            )),
        }
    }
}

/// Pluggable credential check for the accepting side of a handshake.
/// Defaults to accepting everything, since authenticating credentials
/// against a real identity backend is this crate's caller's concern.
#[async_trait]
pub trait LoginValidator: Send + Sync {
    async fn validate(&self, credentials: &[u8]) -> LoginOutcome;
}

pub struct AllowAllValidator;

#[async_trait]
impl LoginValidator for AllowAllValidator {
    async fn validate(&self, _credentials: &[u8]) -> LoginOutcome {
        LoginOutcome::Accepted
    }
}

#[derive(Default)]
struct Waiters {
    login: Option<oneshot::Sender<DecodedMessage>>,
    logout: Option<oneshot::Sender<DecodedMessage>>,
}

pub struct SessionCoordinator {
    tx: Arc<TxBuffer>,
    waiters: Mutex<Waiters>,
    validator: Arc<dyn LoginValidator>,
}

impl SessionCoordinator {
    pub fn new(tx: Arc<TxBuffer>) -> Self {
        Self::with_validator(tx, Arc::new(AllowAllValidator))
    }

    pub fn with_validator(tx: Arc<TxBuffer>, validator: Arc<dyn LoginValidator>) -> Self {
        Self {
            tx,
            waiters: Mutex::new(Waiters::default()),
            validator,
        }
    }

    /// Sends `Login` with `credentials` and awaits `LoginResponse`, failing
    /// with `LoginTimeout` if `timeout_after` elapses first.
    pub async fn login(&self, credentials: &[u8], timeout_after: Duration) -> Result<()> {
        let rx = {
            let mut waiters = self.waiters.lock();
            let (tx, rx) = oneshot::channel();
            waiters.login = Some(tx);
            rx
        };
        self.tx.write_message(MessageKind::Login, true, credentials)?;

        let message = timeout(timeout_after, rx).await.map_err(|_| {
            self.waiters.lock().login = None;
            RelayError::new(RetCode::LoginTimeout, "no LoginResponse within the configured timeout")
        })?.map_err(|_| {
            RelayError::new(RetCode::ConnectionShutdown, "coordinator dropped before LoginResponse arrived")
        })?;

        match LoginOutcome::decode(&message.body)? {
            LoginOutcome::Accepted => {
                debug!("login accepted");
                Ok(())
            }
            LoginOutcome::Rejected(reason) => Err(RelayError::new(RetCode::InvalidCredentials, reason)),
        }
    }

    /// Sends `Logout` and awaits `LogoutResponse`, failing with
    /// `LogoutTimeout` if `timeout_after` elapses first.
    pub async fn logout(&self, timeout_after: Duration) -> Result<()> {
        let rx = {
            let mut waiters = self.waiters.lock();
            let (tx, rx) = oneshot::channel();
            waiters.logout = Some(tx);
            rx
        };
        self.tx.write_message(MessageKind::Logout, true, &[])?;

        timeout(timeout_after, rx).await.map_err(|_| {
            self.waiters.lock().logout = None;
            RelayError::new(RetCode::LogoutTimeout, "no LogoutResponse within the configured timeout")
        })?.map_err(|_| {
            RelayError::new(RetCode::ConnectionShutdown, "coordinator dropped before LogoutResponse arrived")
        })?;
        Ok(())
    }

    /// Handles an inbound login/logout-family frame. Called by the rx
    /// pipeline for the four kinds that carry no `CallId`.
    pub async fn on_message(&self, message: DecodedMessage) -> Result<()> {
        match message.kind {
            MessageKind::LoginResponse => self.resolve(message, |w| &mut w.login),
            MessageKind::LogoutResponse => self.resolve(message, |w| &mut w.logout),
            MessageKind::Login => self.accept_login(message).await,
            MessageKind::Logout => self.accept_logout(),
            other => Err(RelayError::new(
                RetCode::ProtocolViolation,
                format!("{other:?} is not a session-coordinator frame"),
            )),
        }
    }

    fn resolve(
        &self,
        message: DecodedMessage,
        slot: impl FnOnce(&mut Waiters) -> &mut Option<oneshot::Sender<DecodedMessage>>,
    ) -> Result<()> {
        let sender = slot(&mut self.waiters.lock()).take();
        match sender {
            Some(sender) => {
                let _ = sender.send(message);
                Ok(())
            }
            None => {
                warn!(kind = ?message.kind, "unsolicited session-coordinator response, dropping");
                Ok(())
            }
        }
    }

    async fn accept_login(&self, message: DecodedMessage) -> Result<()> {
        let outcome = self.validator.validate(&message.body).await;
        self.tx
            .write_message(MessageKind::LoginResponse, true, &outcome.encode())
    }

    fn accept_logout(&self) -> Result<()> {
        self.tx.write_message(MessageKind::LogoutResponse, true, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SegmentPool;
    use bytes::Bytes;

    #[tokio::test]
    async fn login_resolves_on_accepted_response() {
        let tx = Arc::new(TxBuffer::new(SegmentPool::new(1024)));
        let coordinator = Arc::new(SessionCoordinator::new(tx));
        let c2 = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move { c2.login(b"token", Duration::from_secs(1)).await });

        tokio::task::yield_now().await;
        coordinator
            .on_message(DecodedMessage {
                kind: MessageKind::LoginResponse,
                call_id: None,
                sequence: None,
                body: Bytes::from_static(&[0]),
            })
            .await
            .unwrap();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn login_times_out_without_a_response() {
        let tx = Arc::new(TxBuffer::new(SegmentPool::new(1024)));
        let coordinator = SessionCoordinator::new(tx);
        let err = coordinator.login(b"token", Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.code(), RetCode::LoginTimeout);
    }

    #[tokio::test]
    async fn rejected_login_reports_invalid_credentials() {
        let tx = Arc::new(TxBuffer::new(SegmentPool::new(1024)));
        let coordinator = Arc::new(SessionCoordinator::new(tx));
        let c2 = Arc::clone(&coordinator);
        let handle = tokio::spawn(async move { c2.login(b"token", Duration::from_secs(1)).await });

        tokio::task::yield_now().await;
        let mut body = vec![1u8];
        body.extend_from_slice(b"bad token");
        coordinator
            .on_message(DecodedMessage {
                kind: MessageKind::LoginResponse,
                call_id: None,
                sequence: None,
                body: Bytes::from(body),
            })
            .await
            .unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), RetCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn inbound_login_is_accepted_by_default_validator() {
        let tx = Arc::new(TxBuffer::new(SegmentPool::new(1024)));
        let coordinator = SessionCoordinator::new(tx.clone());
        coordinator
            .on_message(DecodedMessage {
                kind: MessageKind::Login,
                call_id: None,
                sequence: None,
                body: Bytes::from_static(b"whoever"),
            })
            .await
            .unwrap();
        assert!(tx.data_size() > 0);
    }
}
