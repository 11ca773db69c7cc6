//! One WebSocket client connection.
//!
//! Each connection owns a broker session and a reply channel. Inbound text
//! frames are parsed as `ClientFrame`s and sent through the session with the
//! connection's reply channel as reply-to; replies and pushes are written
//! back as JSON text frames by a separate writer task.

use crate::broker::Broker;
use crate::session::{Envelope, ReplyChannel, SessionHandle};
use broker_core::{ClientFrame, Reply};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Largest message or frame accepted from a client. Enforced by the
/// WebSocket layer while reading, see `ClientServer::accept_connection`.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A WebSocket client bound to a broker session.
pub struct ClientConnection {
    addr: SocketAddr,
    broker: Broker,
    session: Option<SessionHandle>,
    reply_to: ReplyChannel,
    /// Handle to the write task
    write_task: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Wrap an upgraded stream and open its session.
    ///
    /// Returns the connection and the read half to pass to [`run`](Self::run).
    pub fn new(
        addr: SocketAddr,
        broker: Broker,
        ws_stream: WebSocketStream<TcpStream>,
    ) -> (Self, SplitStream<WebSocketStream<TcpStream>>) {
        let (write, read) = ws_stream.split();
        let (reply_to, replies) = broker.reply_channel();

        let write_addr = addr;
        let write_task = tokio::spawn(async move {
            Self::write_loop(write_addr, write, replies).await;
        });

        let mut conn = Self {
            addr,
            broker,
            session: None,
            reply_to,
            write_task: Some(write_task),
        };
        conn.ensure_session();
        (conn, read)
    }

    /// Forward replies to the socket until the channel or the socket closes.
    async fn write_loop(
        addr: SocketAddr,
        mut write: SplitSink<WebSocketStream<TcpStream>, Message>,
        mut replies: mpsc::Receiver<Reply>,
    ) {
        while let Some(reply) = replies.recv().await {
            let json = match reply.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode {} for {}: {}", reply.kind(), addr, e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json)).await {
                debug!("Write to {} failed, dropping replies: {}", addr, e);
                break;
            }
        }
        if let Err(e) = write.send(Message::Close(None)).await {
            debug!("Close frame to {} not sent: {}", addr, e);
        }
    }

    /// The session of this connection, opening a new one if there is none
    /// or the previous one was reclaimed.
    fn ensure_session(&mut self) -> Option<&SessionHandle> {
        let stale = self.session.as_ref().is_none_or(|s| s.is_closed());
        if stale {
            match self.broker.open_session() {
                Ok(session) => {
                    debug!("Connection {} bound to session {}", self.addr, session.id());
                    self.session = Some(session);
                }
                Err(e) => {
                    warn!("No session for {}: {}", self.addr, e);
                    self.session = None;
                }
            }
        }
        self.session.as_ref()
    }

    /// Read frames until the client goes away, then close the session.
    pub async fn run(mut self, mut read: SplitStream<WebSocketStream<TcpStream>>) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Binary(data) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Non-UTF-8 frame from {}, dropping", self.addr);
                                continue;
                            }
                        },
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame from {}", self.addr);
                            break;
                        }
                    };

                    match ClientFrame::from_text(&text) {
                        Some(frame) => self.on_frame(frame).await,
                        None => warn!("Unrecognized frame from {}, dropping", self.addr),
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", self.addr);
                        }
                        WsError::Capacity(e) => {
                            warn!("Dropping {}: {} (limit {} bytes)", self.addr, e, MAX_FRAME_SIZE);
                        }
                        _ => error!("WebSocket error on {}: {}", self.addr, e),
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", self.addr);
                    break;
                }
            }
        }

        self.close().await;
    }

    async fn on_frame(&mut self, frame: ClientFrame) {
        let reply_to = self.reply_to.clone();
        let addr = self.addr;
        let Some(session) = self.ensure_session() else {
            debug!("Dropping {} from {}: no session", frame.request.kind(), addr);
            return;
        };

        let mut envelope = Envelope::new(frame.request).reply_to(reply_to);
        if frame.terminal {
            envelope = envelope.terminal(session.id());
        }
        session.send(envelope).await;

        // The tagged session is finished; the next frame gets a fresh one.
        if frame.terminal {
            self.session = None;
        }
    }

    /// Close the session and stop writing.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.broker.close_session(session.id());
        }
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        info!("Client {} disconnected", self.addr);
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
    }
}
