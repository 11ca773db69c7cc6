//! Message taxonomy exchanged between clients and the broker.
//!
//! Requests flow client → broker, replies flow broker → client. Both are
//! serialized as JSON objects tagged by `type` when they cross a socket.

use crate::record::{ClientId, ClientRecord};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use uuid::Uuid;

/// Identifier of a broker reply session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests a client can send to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    /// Start receiving pushes and get a full synchronization
    Register,
    /// Stop receiving pushes
    Unregister,
    /// Connected clients plus drained notifications, in one reply
    AskAllUpdates,
    /// Payload of one client; unknown ids get no reply at all
    AskClientDetail { id: ClientId },
    /// Snapshot of all connected clients
    AskConnectedClients,
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register => "Register",
            Request::Unregister => "Unregister",
            Request::AskAllUpdates => "AskAllUpdates",
            Request::AskClientDetail { .. } => "AskClientDetail",
            Request::AskConnectedClients => "AskConnectedClients",
        }
    }

    /// Whether the request produces replies, and so needs a reply-to.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Request::Unregister)
    }
}

/// Messages the broker sends back to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    /// Port the heartbeat ingestion listener is bound to
    PortAssigned { port: u16 },
    /// Informational text
    DebugText { text: String },
    AllUpdates {
        clients: Vec<ClientRecord>,
        notifications: Vec<String>,
    },
    ClientDetail { id: ClientId, payload: Vec<String> },
    ConnectedClients { clients: Vec<ClientRecord> },
    /// Pushed when registry membership or a record changes
    ClientsChanged,
    /// Pushed when a producer reports a dead process
    ProcessDied { text: String },
}

impl Reply {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::PortAssigned { .. } => "PortAssigned",
            Reply::DebugText { .. } => "DebugText",
            Reply::AllUpdates { .. } => "AllUpdates",
            Reply::ClientDetail { .. } => "ClientDetail",
            Reply::ConnectedClients { .. } => "ConnectedClients",
            Reply::ClientsChanged => "ClientsChanged",
            Reply::ProcessDied { .. } => "ProcessDied",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A request as sent over a client socket.
///
/// `terminal` asks the broker to reclaim the connection's session once
/// this request has been handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub request: Request,
    #[serde(default)]
    pub terminal: bool,
}

impl ClientFrame {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            terminal: false,
        }
    }

    pub fn terminal(request: Request) -> Self {
        Self {
            request,
            terminal: true,
        }
    }

    /// Try to parse a frame from text.
    ///
    /// Returns None if the text is not a valid frame.
    pub fn from_text(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
