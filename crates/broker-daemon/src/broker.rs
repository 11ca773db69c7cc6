//! Session broker: correlates client requests with replies.
//!
//! The broker only depends on capability traits: a `ClientDirectory` to
//! answer client queries and a `NotificationDrain` for process-died
//! notifications. Whoever starts the process wires in the concrete registry
//! and queue and owns the broker handle.

use crate::config::BrokerConfig;
use crate::session::{
    DeliveryError, Envelope, ReplyChannel, SessionHandle, SessionState, SessionTable,
};
use broker_core::{
    ClientDirectory, NotificationDrain, PendingBuffer, RegistryEvent, Reply, Request, SessionId,
};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix for the broker's own informational text.
const DEBUG_PREFIX: &str = "Broker> ";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Session limit reached ({0} open sessions)")]
    SessionLimit(usize),
}

struct BrokerInner {
    instance_id: Uuid,
    config: BrokerConfig,
    directory: Arc<dyn ClientDirectory>,
    notifications: Arc<dyn NotificationDrain>,
    pending: PendingBuffer,
    sessions: SessionTable,
    assigned_port: RwLock<Option<u16>>,
}

/// Handle to the broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        directory: Arc<dyn ClientDirectory>,
        notifications: Arc<dyn NotificationDrain>,
    ) -> Self {
        let sessions = SessionTable::new(config.max_sessions);
        Self {
            inner: Arc::new(BrokerInner {
                instance_id: Uuid::new_v4(),
                config,
                directory,
                notifications,
                pending: PendingBuffer::new(),
                sessions,
                assigned_port: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Create a reply channel sized by this broker's configuration.
    pub fn reply_channel(&self) -> (ReplyChannel, mpsc::Receiver<Reply>) {
        ReplyChannel::new(self.inner.config.reply_capacity, self.inner.config.send_timeout)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Allocate a session with its own worker context.
    ///
    /// Fails only when the session limit is reached; existing sessions keep
    /// being served.
    pub fn open_session(&self) -> Result<SessionHandle, BrokerError> {
        let id = SessionId::generate();
        let (tx, rx) = mpsc::channel(self.inner.config.session_inbox.max(1));
        let handle = SessionHandle::new(id, tx, self.inner.config.send_timeout);
        let close = CancellationToken::new();

        if let Err(open) = self.inner.sessions.insert(id, close.clone()) {
            warn!("Refusing new session: {} sessions already open", open);
            return Err(BrokerError::SessionLimit(open));
        }

        let broker = self.clone();
        tokio::spawn(async move {
            broker.run_session(id, rx, close).await;
        });

        debug!("Session {} opened", id);
        Ok(handle)
    }

    /// Worker loop for one session. Requests are handled strictly in order,
    /// and the session is only reclaimed after the request carrying its
    /// terminal tag has been fully handled.
    ///
    /// The loop also ends when `close` is cancelled (checked between
    /// requests) or when every handle to the session is gone.
    async fn run_session(
        &self,
        id: SessionId,
        mut rx: mpsc::Receiver<Envelope>,
        close: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                biased;
                () = close.cancelled() => {
                    debug!("Session {} cancelled", id);
                    break;
                }
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => {
                        debug!("Session {} has no handles left", id);
                        break;
                    }
                },
            };

            let terminal = envelope.terminal;
            if terminal == Some(id) {
                self.inner.sessions.begin_terminal(id);
            }

            self.handle(Some(id), envelope).await;

            match terminal {
                Some(target) if target == id => break,
                Some(target) => self.close_session(target),
                None => {}
            }
        }

        self.inner.sessions.begin_terminal(id);
        let removed = self.inner.sessions.finalize(id);
        debug_assert!(removed, "session {} finalized twice", id);
        // Anything still queued is dropped with the receiver.
        drop(rx);
        debug!("Session {} closed", id);
    }

    /// Close a session. Idempotent: closing a closed or unknown session is a no-op.
    ///
    /// Never waits on the session's inbox. The request in progress finishes;
    /// requests still queued behind it are dropped.
    pub fn close_session(&self, id: SessionId) {
        if !self.inner.sessions.cancel(id) {
            debug!("Session {} already closed", id);
        }
    }

    pub fn session_state(&self, id: SessionId) -> SessionState {
        self.inner.sessions.state(id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of sessions currently receiving pushes.
    pub fn registered_count(&self) -> usize {
        self.inner.sessions.registered_count()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Handle an envelope immediately, outside any session.
    ///
    /// A Register handled this way gets its synchronization replies but no
    /// push registration, since there is no session to attach it to.
    pub async fn dispatch(&self, envelope: Envelope) {
        let terminal = envelope.terminal;
        self.handle(None, envelope).await;
        if let Some(target) = terminal {
            self.close_session(target);
        }
    }

    async fn handle(&self, session: Option<SessionId>, envelope: Envelope) {
        let Envelope {
            request, reply_to, ..
        } = envelope;

        debug!(
            "Handling {} (session: {:?})",
            request.kind(),
            session.map(|id| id.to_string())
        );

        if request.expects_reply() && reply_to.is_none() {
            debug!("{} has no reply-to, nothing to answer", request.kind());
            return;
        }

        match request {
            Request::Register => {
                if let Some(channel) = reply_to {
                    self.on_register(session, channel).await;
                }
            }
            Request::Unregister => {
                if let Some(id) = session {
                    if self.inner.sessions.unregister(id) {
                        info!("Session {} unregistered", id);
                    }
                }
            }
            Request::AskConnectedClients => {
                if let Some(channel) = reply_to {
                    let clients = self.inner.directory.list();
                    self.reply(&channel, Reply::ConnectedClients { clients }).await;
                }
            }
            Request::AskClientDetail { id } => {
                let Some(channel) = reply_to else { return };
                match self.inner.directory.get(&id) {
                    Some(record) => {
                        let reply = Reply::ClientDetail {
                            id: record.id,
                            payload: record.payload,
                        };
                        self.reply(&channel, reply).await;
                    }
                    None => {
                        // Unknown ids are answered with silence, not an error.
                        debug!("Detail requested for unknown client {}, not replying", id);
                    }
                }
            }
            Request::AskAllUpdates => {
                if let Some(channel) = reply_to {
                    let clients = self.inner.directory.list();
                    let notifications = self.inner.notifications.drain();
                    let reply = Reply::AllUpdates {
                        clients,
                        notifications,
                    };
                    self.reply(&channel, reply).await;
                }
            }
        }
    }

    /// Registration sequence: port, client snapshot, diagnostics, pending
    /// flush, then attach `channel` to the session for pushes.
    async fn on_register(&self, session: Option<SessionId>, channel: ReplyChannel) {
        if let Some(port) = self.assigned_port() {
            self.reply(&channel, Reply::PortAssigned { port }).await;
        }

        let clients = self.inner.directory.list();
        let client_count = clients.len();
        self.reply(&channel, Reply::ConnectedClients { clients }).await;

        let pending = self.inner.pending.drain();
        self.debug_text(
            &channel,
            format!("Synchronizing with client, {} pending messages", pending.len()),
        )
        .await;
        self.debug_text(&channel, format!("Broker instance = {}", self.inner.instance_id))
            .await;
        self.debug_text(&channel, format!("There are {} connected clients", client_count))
            .await;
        for text in pending {
            self.reply(&channel, Reply::DebugText { text }).await;
        }

        match session {
            Some(id) if self.inner.sessions.register(id, channel) => {
                info!("Session {} registered for pushes", id);
            }
            Some(id) => debug!("Session {} closed before registration completed", id),
            None => debug!("Register handled outside a session, no pushes attached"),
        }
    }

    async fn debug_text(&self, channel: &ReplyChannel, text: String) {
        let text = format!("{}{}", DEBUG_PREFIX, text);
        self.reply(channel, Reply::DebugText { text }).await;
    }

    /// Send one reply; failures are logged and the reply dropped.
    async fn reply(&self, channel: &ReplyChannel, reply: Reply) -> bool {
        let kind = reply.kind();
        match channel.send(reply).await {
            Ok(()) => true,
            Err(DeliveryError::Closed) => {
                debug!("Dropping {} reply: requester gone", kind);
                false
            }
            Err(e) => {
                warn!("Dropping {} reply: {}", kind, e);
                false
            }
        }
    }

    // ========================================================================
    // Pushes and notices
    // ========================================================================

    /// Deliver `reply` to every registered session without waiting.
    ///
    /// Registrations whose channel is gone are dropped.
    fn push_all(&self, reply: Reply) -> usize {
        let mut delivered = 0;
        for (id, result) in self.inner.sessions.push_registered(&reply) {
            match result {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Closed) => {
                    debug!("Push channel of session {} closed, unregistering", id);
                    self.inner.sessions.unregister(id);
                }
                Err(e) => warn!("Dropping {} push to session {}: {}", reply.kind(), id, e),
            }
        }
        delivered
    }

    /// Registry hook: tell registered sessions the client set changed.
    pub fn on_registry_event(&self, event: &RegistryEvent) {
        let delivered = self.push_all(Reply::ClientsChanged);
        debug!("Registry event {:?} pushed to {} session(s)", event, delivered);
    }

    /// Ingestion hook: tell registered sessions a process died.
    pub fn on_process_died(&self, text: &str) {
        let delivered = self.push_all(Reply::ProcessDied {
            text: text.to_string(),
        });
        debug!("Process-died notice pushed to {} session(s)", delivered);
    }

    /// Send informational text to registered sessions, buffering it for the
    /// next registration if nobody takes it.
    pub fn notice(&self, text: impl Into<String>) {
        let text = text.into();
        let delivered = self.push_all(Reply::DebugText { text: text.clone() });
        if delivered == 0 {
            debug!("No session took notice, buffering: {}", text);
            self.inner.pending.push(text);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // Ingestion port
    // ========================================================================

    pub fn set_assigned_port(&self, port: u16) {
        *self.inner.assigned_port.write().unwrap_or_else(|e| e.into_inner()) = Some(port);
        info!("Ingestion port assigned: {}", port);
    }

    pub fn assigned_port(&self) -> Option<u16> {
        *self.inner.assigned_port.read().unwrap_or_else(|e| e.into_inner())
    }
}
