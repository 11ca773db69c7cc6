//! Buffer for notices that could not be delivered to any session.
//!
//! Items are flushed on the next registration. A drained item is gone,
//! whether or not the flush reaches the peer.

use crate::stack::ConcurrentStack;

#[derive(Debug, Default)]
pub struct PendingBuffer {
    stack: ConcurrentStack<String>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        self.stack.push(message.into());
    }

    /// Take every buffered message, leaving the buffer empty.
    pub fn drain(&self) -> Vec<String> {
        self.stack.drain()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
