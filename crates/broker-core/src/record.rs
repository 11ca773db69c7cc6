//! ClientRecord: the state a producer reports in its heartbeats.
//!
//! A record is an immutable value. A newer heartbeat for the same id
//! replaces the record wholesale rather than patching it.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while building or decoding client records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Client ID cannot be empty")]
    EmptyId,
    #[error("Malformed record: {0}")]
    Malformed(String),
    #[error("Invalid payload list: {0}")]
    InvalidPayload(String),
}

/// Opaque unique identifier of a remote producer.
///
/// Producers usually send a UUID, but any non-empty string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID, rejecting the empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, RecordError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RecordError::EmptyId);
        }
        Ok(Self(id))
    }

    /// Generate a fresh random ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> String {
        id.0
    }
}

/// Latest known state of a live producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: ClientId,
    /// Human-readable producer name
    #[serde(rename = "name")]
    pub display_name: String,
    /// Ordered payload entries (e.g. the producer's watched processes)
    pub payload: Vec<String>,
}

impl ClientRecord {
    pub fn new(id: ClientId, display_name: impl Into<String>, payload: Vec<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            payload,
        }
    }
}
