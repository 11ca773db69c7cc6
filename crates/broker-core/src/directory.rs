//! Capability traits the broker reads through.
//!
//! Implementations:
//! - `ClientRegistry` (in broker-daemon) - heartbeat-driven, TTL-expiring
//! - `InMemoryDirectory` - fixed contents, for testing
//! - `NotificationQueue` - implements `NotificationDrain`

use crate::record::{ClientId, ClientRecord};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Read access to the set of live clients.
pub trait ClientDirectory: Send + Sync {
    /// Snapshot of every live client.
    fn list(&self) -> Vec<ClientRecord>;

    /// Look up one client. An unknown id is not an error.
    fn get(&self, id: &ClientId) -> Option<ClientRecord>;
}

/// Source of pending process-died notifications.
pub trait NotificationDrain: Send + Sync {
    /// Remove and return every pending notification.
    fn drain(&self) -> Vec<String>;
}

/// Directory with explicitly managed contents.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    records: RwLock<BTreeMap<ClientId, ClientRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ClientRecord) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &ClientId) -> Option<ClientRecord> {
        self.records.write().unwrap_or_else(|e| e.into_inner()).remove(id)
    }
}

impl ClientDirectory for InMemoryDirectory {
    fn list(&self) -> Vec<ClientRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn get(&self, id: &ClientId) -> Option<ClientRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}
