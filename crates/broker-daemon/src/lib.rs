//! broker-daemon library: the runtime half of the heartbeat broker.
//!
//! Exposes the registry, session broker, poller and socket front-ends so
//! integration tests can drive them directly.

pub mod broker;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod ingest;
pub mod poller;
pub mod registry;
pub mod server;
pub mod session;

// Re-export key types for convenience
pub use broker::{Broker, BrokerError};
pub use config::BrokerConfig;
pub use daemon::Daemon;
pub use poller::Poller;
pub use registry::ClientRegistry;
pub use server::ClientServer;
pub use session::{DeliveryError, Envelope, ReplyChannel, SessionHandle, SessionState};
