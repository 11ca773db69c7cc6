//! Wiring of registry, notification queue and broker.

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::registry::ClientRegistry;
use broker_core::{IngestItem, NotificationQueue, Subscription};
use std::sync::Arc;
use tracing::debug;

/// The broker together with the stores it answers from.
///
/// Registry changes are pushed to registered sessions for as long as the
/// daemon is alive.
pub struct Daemon {
    registry: ClientRegistry,
    notifications: Arc<NotificationQueue>,
    broker: Broker,
    _subscription: Subscription,
}

impl Daemon {
    pub fn new(config: BrokerConfig) -> Self {
        let registry = ClientRegistry::new(config.client_ttl);
        let notifications = Arc::new(NotificationQueue::new());
        let broker = Broker::new(config, Arc::new(registry.clone()), notifications.clone());

        let hook = broker.clone();
        let subscription = registry.events().subscribe(move |event| {
            hook.on_registry_event(&event);
        });

        Self {
            registry,
            notifications,
            broker,
            _subscription: subscription,
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn notifications(&self) -> &Arc<NotificationQueue> {
        &self.notifications
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Apply one decoded ingestion item.
    pub fn apply(&self, item: IngestItem) {
        match item {
            IngestItem::Heartbeat(heartbeat) => self.registry.apply(heartbeat),
            IngestItem::ProcessDied(text) => {
                debug!("Process died: {}", text);
                self.notifications.push(text.clone());
                self.broker.on_process_died(&text);
            }
        }
    }
}
