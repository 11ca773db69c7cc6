//! Queue of "process died" notifications.
//!
//! Ingestion pushes, a presenter drains in bulk. No ordering is promised,
//! only that every pushed notification is drained exactly once.

use crate::directory::NotificationDrain;
use crate::stack::ConcurrentStack;

#[derive(Debug, Default)]
pub struct NotificationQueue {
    stack: ConcurrentStack<String>,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, notification: impl Into<String>) {
        self.stack.push(notification.into());
    }

    /// Remove and return every queued notification.
    pub fn drain_all(&self) -> Vec<String> {
        self.stack.drain()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationDrain for NotificationQueue {
    fn drain(&self) -> Vec<String> {
        self.drain_all()
    }
}
