//! WebSocket endpoint for broker clients.
//!
//! Every accepted connection becomes a [`ClientConnection`] with its own
//! session. The server itself keeps no per-client state.

use crate::broker::Broker;
use crate::connection::{ClientConnection, MAX_FRAME_SIZE};
use anyhow::Result;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info};

/// WebSocket server handing connections to the broker.
#[derive(Clone)]
pub struct ClientServer {
    broker: Broker,
}

impl ClientServer {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Client endpoint listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.accept_connection(stream, addr).await;
                    });
                }
                Err(e) => error!("Failed to accept client: {}", e),
            }
        }
    }

    /// Upgrade a TCP connection and serve it until it closes.
    ///
    /// Messages over [`MAX_FRAME_SIZE`] are refused while being read and end
    /// the connection.
    pub async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let ws_stream = match accept_async_with_config(stream, Some(ws_config())).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        info!("Client connected from {}", addr);
        let (conn, read) = ClientConnection::new(addr, self.broker.clone(), ws_stream);
        conn.run(read).await;
    }
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_SIZE);
    config.max_frame_size = Some(MAX_FRAME_SIZE);
    config
}
