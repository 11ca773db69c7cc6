//! broker-core: transport-free building blocks for the heartbeat broker.
//!
//! This crate provides:
//! - The client data model (`ClientId`, `ClientRecord`)
//! - Heartbeat record decoding, including the per-connection key/value protocol
//! - The request/reply message taxonomy exchanged with broker sessions
//! - `EventBus` for registry change notifications
//! - The concurrent stacks backing the notification queue and pending-message buffer
//! - Capability traits (`ClientDirectory`, `NotificationDrain`) the broker depends on

pub mod directory;
pub mod events;
pub mod heartbeat;
pub mod notifications;
pub mod pending;
pub mod protocol;
pub mod record;
mod stack;

pub use directory::{ClientDirectory, InMemoryDirectory, NotificationDrain};
pub use events::{EventBus, LeaveReason, RegistryEvent, Subscription};
pub use heartbeat::{decode_line, decode_record, HeartbeatRecord, IngestItem, KeyValueProducer};
pub use notifications::NotificationQueue;
pub use pending::PendingBuffer;
pub use protocol::{ClientFrame, Reply, Request, SessionId};
pub use record::{ClientId, ClientRecord, RecordError};
