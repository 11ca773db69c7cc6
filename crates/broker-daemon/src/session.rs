//! Reply channels and the session table.
//!
//! A session is a worker task with its own inbox. Requests sent to it are
//! handled in submission order; replies go to whatever `ReplyChannel` the
//! request names as reply-to. Sessions move `Open → TerminalPending →
//! Closed`, and a closed session is gone from the table for good.
//!
//! The table never holds a session's inbox sender. A session closes when it
//! is cancelled through the table, when it handles its own terminal tag, or
//! when every `SessionHandle` to it has been dropped.

use broker_core::{Reply, Request, SessionId};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a reply could not be handed to its requester.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("reply channel closed (requester gone)")]
    Closed,
    #[error("reply channel full")]
    Full,
    #[error("reply channel still full after {0:?}")]
    TimedOut(Duration),
}

/// Addressable destination for broker replies.
///
/// Every send is a bounded attempt: a broken or saturated channel yields a
/// `DeliveryError` and the reply is dropped.
#[derive(Debug, Clone)]
pub struct ReplyChannel {
    tx: mpsc::Sender<Reply>,
    send_timeout: Duration,
}

impl ReplyChannel {
    /// Create a channel and the receiver its replies arrive on.
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, send_timeout }, rx)
    }

    /// Send, waiting at most the configured timeout for queue space.
    pub async fn send(&self, reply: Reply) -> Result<(), DeliveryError> {
        self.tx
            .send_timeout(reply, self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(self.send_timeout),
            })
    }

    /// Send without waiting. Used for pushes from synchronous contexts.
    pub fn push(&self, reply: Reply) -> Result<(), DeliveryError> {
        self.tx.try_send(reply).map_err(|e| match e {
            TrySendError::Closed(_) => DeliveryError::Closed,
            TrySendError::Full(_) => DeliveryError::Full,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether both handles point at the same receiver.
    pub fn same_channel(&self, other: &ReplyChannel) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// A request with its routing information.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub request: Request,
    /// Where replies go; `None` makes the request fire-and-forget
    pub reply_to: Option<ReplyChannel>,
    /// Session to reclaim once this request has been handled
    pub terminal: Option<SessionId>,
}

impl Envelope {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            reply_to: None,
            terminal: None,
        }
    }

    pub fn reply_to(mut self, channel: ReplyChannel) -> Self {
        self.reply_to = Some(channel);
        self
    }

    /// Tag the envelope so `session` is reclaimed after it is processed.
    pub fn terminal(mut self, session: SessionId) -> Self {
        self.terminal = Some(session);
        self
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting and handling requests
    Open,
    /// Tagged terminal or cancelled; finishes the current request, then closes
    TerminalPending,
    /// Worker context reclaimed
    Closed,
}

/// Caller's handle to a session's worker context.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    inbox: mpsc::Sender<Envelope>,
    send_timeout: Duration,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, inbox: mpsc::Sender<Envelope>, send_timeout: Duration) -> Self {
        Self {
            id,
            inbox,
            send_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue an envelope for this session.
    ///
    /// Returns false, dropping the envelope, if the session is closed or its
    /// inbox stayed full for the send timeout.
    pub async fn send(&self, envelope: Envelope) -> bool {
        match self.inbox.send_timeout(envelope, self.send_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Closed(_)) => {
                debug!("Session {} closed, dropping request", self.id);
                false
            }
            Err(SendTimeoutError::Timeout(_)) => {
                debug!("Session {} inbox full, dropping request", self.id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Wait until the worker context has been reclaimed.
    pub async fn closed(&self) {
        self.inbox.closed().await
    }
}

struct SessionSlot {
    state: SessionState,
    /// Cancelled to stop the worker between requests
    close: CancellationToken,
    /// Channel given by the session's Register; receives pushes
    registration: Option<ReplyChannel>,
}

/// Open sessions, keyed by id.
pub(crate) struct SessionTable {
    max_sessions: usize,
    slots: RwLock<HashMap<SessionId, SessionSlot>>,
}

impl SessionTable {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionSlot>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, SessionSlot>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an open session. Fails with the current count when full.
    pub(crate) fn insert(&self, id: SessionId, close: CancellationToken) -> Result<(), usize> {
        let mut slots = self.write();
        if slots.len() >= self.max_sessions {
            return Err(slots.len());
        }
        slots.insert(
            id,
            SessionSlot {
                state: SessionState::Open,
                close,
                registration: None,
            },
        );
        Ok(())
    }

    /// Current state; unknown ids read as closed.
    pub(crate) fn state(&self, id: SessionId) -> SessionState {
        self.read()
            .get(&id)
            .map(|slot| slot.state)
            .unwrap_or(SessionState::Closed)
    }

    /// `Open → TerminalPending`. Returns false if the session is not open.
    pub(crate) fn begin_terminal(&self, id: SessionId) -> bool {
        match self.write().get_mut(&id) {
            Some(slot) if slot.state == SessionState::Open => {
                slot.state = SessionState::TerminalPending;
                true
            }
            _ => false,
        }
    }

    /// Mark the session terminal and signal its worker to stop.
    ///
    /// Returns false if the session is already gone.
    pub(crate) fn cancel(&self, id: SessionId) -> bool {
        match self.write().get_mut(&id) {
            Some(slot) => {
                if slot.state == SessionState::Open {
                    slot.state = SessionState::TerminalPending;
                }
                slot.close.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the session. Returns true only for the call that removed it.
    ///
    /// The registration goes with it under the write lock, so no push can
    /// reach the session's channel once this returns.
    pub(crate) fn finalize(&self, id: SessionId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub(crate) fn register(&self, id: SessionId, channel: ReplyChannel) -> bool {
        match self.write().get_mut(&id) {
            Some(slot) => {
                slot.registration = Some(channel);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unregister(&self, id: SessionId) -> bool {
        self.write()
            .get_mut(&id)
            .and_then(|slot| slot.registration.take())
            .is_some()
    }

    /// Push `reply` to every registered session without waiting.
    ///
    /// Runs under the read lock so it cannot interleave with `finalize`.
    pub(crate) fn push_registered(&self, reply: &Reply) -> Vec<(SessionId, Result<(), DeliveryError>)> {
        self.read()
            .iter()
            .filter_map(|(id, slot)| {
                let channel = slot.registration.as_ref()?;
                Some((*id, channel.push(reply.clone())))
            })
            .collect()
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.read()
            .values()
            .filter(|slot| slot.registration.is_some())
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn handle() -> (SessionHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(4);
        (SessionHandle::new(SessionId::generate(), tx, TIMEOUT), rx)
    }

    fn open(table: &SessionTable) -> (SessionId, CancellationToken) {
        let id = SessionId::generate();
        let close = CancellationToken::new();
        table.insert(id, close.clone()).unwrap();
        (id, close)
    }

    #[tokio::test]
    async fn test_reply_channel_reports_closed() {
        let (channel, rx) = ReplyChannel::new(4, TIMEOUT);
        drop(rx);
        assert_eq!(channel.send(Reply::ClientsChanged).await, Err(DeliveryError::Closed));
        assert_eq!(channel.push(Reply::ClientsChanged), Err(DeliveryError::Closed));
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_channel_send_is_bounded() {
        let (channel, mut rx) = ReplyChannel::new(1, TIMEOUT);
        channel.send(Reply::ClientsChanged).await.unwrap();

        assert_eq!(channel.push(Reply::ClientsChanged), Err(DeliveryError::Full));
        assert_eq!(
            channel.send(Reply::ClientsChanged).await,
            Err(DeliveryError::TimedOut(TIMEOUT))
        );

        assert_eq!(rx.recv().await, Some(Reply::ClientsChanged));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_same_channel() {
        let (a, _rx_a) = ReplyChannel::new(1, TIMEOUT);
        let (b, _rx_b) = ReplyChannel::new(1, TIMEOUT);
        assert!(a.same_channel(&a.clone()));
        assert!(!a.same_channel(&b));
    }

    #[tokio::test]
    async fn test_send_to_closed_session_is_noop() {
        let (handle, rx) = handle();
        drop(rx);
        assert!(!handle.send(Envelope::new(Request::AskConnectedClients)).await);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_table_state_transitions() {
        let table = SessionTable::new(8);
        let (id, _close) = open(&table);

        assert_eq!(table.state(id), SessionState::Open);
        assert!(table.begin_terminal(id));
        assert_eq!(table.state(id), SessionState::TerminalPending);
        // Already pending
        assert!(!table.begin_terminal(id));

        assert!(table.finalize(id));
        assert_eq!(table.state(id), SessionState::Closed);
        // Closed is absorbing
        assert!(!table.finalize(id));
        assert!(!table.begin_terminal(id));
        assert!(!table.cancel(id));
    }

    #[test]
    fn test_cancel_marks_terminal_and_signals_worker() {
        let table = SessionTable::new(8);
        let (id, close) = open(&table);

        assert!(table.cancel(id));
        assert!(close.is_cancelled());
        assert_eq!(table.state(id), SessionState::TerminalPending);

        // Cancelling again still finds the slot until it is finalized
        assert!(table.cancel(id));
        assert!(table.finalize(id));
        assert!(!table.cancel(id));
    }

    #[test]
    fn test_table_capacity() {
        let table = SessionTable::new(1);
        open(&table);
        assert_eq!(table.insert(SessionId::generate(), CancellationToken::new()), Err(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_registration_lifecycle() {
        let table = SessionTable::new(8);
        let (id, _close) = open(&table);
        let (channel, mut replies) = ReplyChannel::new(4, TIMEOUT);

        assert!(table.register(id, channel.clone()));
        assert_eq!(table.registered_count(), 1);
        let pushed = table.push_registered(&Reply::ClientsChanged);
        assert_eq!(pushed, vec![(id, Ok(()))]);
        assert_eq!(replies.try_recv().unwrap(), Reply::ClientsChanged);

        assert!(table.unregister(id));
        assert!(!table.unregister(id));
        assert_eq!(table.registered_count(), 0);
        assert!(table.push_registered(&Reply::ClientsChanged).is_empty());
        // Unregister keeps the session itself
        assert_eq!(table.state(id), SessionState::Open);
    }

    #[test]
    fn test_no_push_lands_after_finalize() {
        for _ in 0..100 {
            let table = Arc::new(SessionTable::new(8));
            let (id, _close) = open(&table);
            // The channel outlives the session, as a shared reply-to does
            let (channel, mut replies) = ReplyChannel::new(1024, TIMEOUT);
            table.register(id, channel.clone());

            let pusher = {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..200 {
                        table.push_registered(&Reply::ClientsChanged);
                    }
                })
            };

            table.finalize(id);
            while replies.try_recv().is_ok() {}
            pusher.join().unwrap();

            assert!(replies.try_recv().is_err(), "push delivered after finalize");
            drop(channel);
        }
    }
}
