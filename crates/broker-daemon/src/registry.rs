//! Registry of live producers with heartbeat-driven expiry.
//!
//! Every entry owns one expiry task. An alive heartbeat replaces the record,
//! aborts the previous task and schedules a new one, all under the write
//! lock, so at most one live expiry exists per id. Each schedule carries a
//! generation number: an expiry that lost a race with a refresh sees a newer
//! generation and leaves the entry alone.

use broker_core::{
    ClientDirectory, ClientId, ClientRecord, EventBus, HeartbeatRecord, LeaveReason,
    RegistryEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct Entry {
    record: ClientRecord,
    generation: u64,
    expiry: JoinHandle<()>,
}

struct RegistryInner {
    ttl: Duration,
    entries: RwLock<HashMap<ClientId, Entry>>,
    next_generation: AtomicU64,
    events: Arc<EventBus>,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<ClientId, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ClientId, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Evict `id` if `generation` is still its current schedule.
    fn expire(&self, id: &ClientId, generation: u64) {
        let removed = {
            let mut entries = self.write();
            match entries.get(id) {
                Some(entry) if entry.generation == generation => entries.remove(id),
                _ => None,
            }
        };

        if removed.is_some() {
            info!("Client {} expired after {:?} without heartbeat", id, self.ttl);
            self.events.emit(RegistryEvent::Left {
                id: id.clone(),
                reason: LeaveReason::Expired,
            });
        } else {
            debug!("Stale expiry for {} (generation {}) ignored", id, generation);
        }
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values() {
            entry.expiry.abort();
        }
    }
}

/// Authoritative set of currently-live producers.
///
/// Cheap to clone; clones share state. Mutations spawn expiry tasks, so
/// they must run inside a Tokio runtime.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientRegistry {
    /// Create a registry evicting clients `ttl` after their last heartbeat.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ttl,
                entries: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Bus receiving `RegistryEvent`s for every membership or record change.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Apply a decoded heartbeat.
    pub fn apply(&self, heartbeat: HeartbeatRecord) {
        let alive = heartbeat.alive;
        self.upsert(heartbeat.into_record(), alive);
    }

    /// Refresh-or-insert `record`, or remove it when `alive` is false.
    ///
    /// Refreshing resets the TTL; removal cancels the pending expiry.
    pub fn upsert(&self, record: ClientRecord, alive: bool) {
        let event = if alive {
            self.refresh(record)
        } else {
            self.remove(&record.id)
        };

        // Emit outside the lock so subscribers can read the registry.
        if let Some(event) = event {
            self.inner.events.emit(event);
        }
    }

    fn refresh(&self, record: ClientRecord) -> Option<RegistryEvent> {
        let id = record.id.clone();
        let mut entries = self.inner.write();

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let expiry = self.schedule_expiry(id.clone(), generation);
        let previous = entries.insert(
            id.clone(),
            Entry {
                record,
                generation,
                expiry,
            },
        );

        match previous {
            Some(previous) => {
                previous.expiry.abort();
                debug!("Client {} refreshed (generation {})", id, generation);
                Some(RegistryEvent::Updated { id })
            }
            None => {
                info!("Client {} joined", id);
                Some(RegistryEvent::Joined { id })
            }
        }
    }

    fn remove(&self, id: &ClientId) -> Option<RegistryEvent> {
        let removed = self.inner.write().remove(id);
        let entry = removed?;
        entry.expiry.abort();
        info!("Client {} departed", id);
        Some(RegistryEvent::Left {
            id: id.clone(),
            reason: LeaveReason::Departed,
        })
    }

    fn schedule_expiry(&self, id: ClientId, generation: u64) -> JoinHandle<()> {
        let inner: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        // Deadline is fixed now, not when the task is first polled.
        let deadline = tokio::time::Instant::now() + self.inner.ttl;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&id, generation);
            }
        })
    }

    pub fn get(&self, id: &ClientId) -> Option<ClientRecord> {
        self.inner.read().get(id).map(|entry| entry.record.clone())
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Snapshot of every live record.
    pub fn list(&self) -> Vec<ClientRecord> {
        self.inner
            .read()
            .values()
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClientDirectory for ClientRegistry {
    fn list(&self) -> Vec<ClientRecord> {
        ClientRegistry::list(self)
    }

    fn get(&self, id: &ClientId) -> Option<ClientRecord> {
        ClientRegistry::get(self, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::sleep;

    const TTL: Duration = Duration::from_millis(4000);

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn record(s: &str, name: &str) -> ClientRecord {
        ClientRecord::new(id(s), name, vec!["p1".into()])
    }

    fn record_events(registry: &ClientRegistry) -> (Arc<Mutex<Vec<RegistryEvent>>>, broker_core::Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sub = registry.events().subscribe(move |event| {
            events_clone.lock().unwrap().push(event);
        });
        (events, sub)
    }

    #[tokio::test]
    async fn test_alive_then_departed() {
        let registry = ClientRegistry::new(TTL);

        registry.upsert(record("A", "proc1"), true);
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id("A"));
        assert_eq!(listed[0].display_name, "proc1");

        registry.upsert(record("A", "proc1"), false);
        assert!(registry.list().is_empty());
        assert!(registry.get(&id("A")).is_none());
    }

    #[tokio::test]
    async fn test_departed_for_unknown_id_is_noop() {
        let registry = ClientRegistry::new(TTL);
        let (events, _sub) = record_events(&registry);

        registry.upsert(record("ghost", "x"), false);

        assert!(registry.is_empty());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_replaces_record() {
        let registry = ClientRegistry::new(TTL);
        let (events, _sub) = record_events(&registry);

        registry.upsert(record("A", "old"), true);
        registry.upsert(ClientRecord::new(id("A"), "new", vec!["p2".into()]), true);

        assert_eq!(registry.len(), 1);
        let current = registry.get(&id("A")).unwrap();
        assert_eq!(current.display_name, "new");
        assert_eq!(current.payload, vec!["p2"]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                RegistryEvent::Joined { id: id("A") },
                RegistryEvent::Updated { id: id("A") },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let registry = ClientRegistry::new(TTL);
        registry.upsert(record("B", "proc"), true);

        sleep(Duration::from_millis(3000)).await;
        assert!(registry.contains(&id("B")));

        sleep(Duration::from_millis(2000)).await;
        assert!(!registry.contains(&id("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_below_ttl_keep_entry_alive() {
        let registry = ClientRegistry::new(TTL);
        let (events, _sub) = record_events(&registry);

        for _ in 0..10 {
            registry.upsert(record("A", "proc"), true);
            sleep(Duration::from_millis(3900)).await;
            assert!(registry.contains(&id("A")));
        }

        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .all(|event| !matches!(event, RegistryEvent::Left { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_evicts_exactly_once() {
        let registry = ClientRegistry::new(TTL);
        let (events, _sub) = record_events(&registry);

        registry.upsert(record("A", "proc"), true);
        sleep(Duration::from_millis(1000)).await;
        registry.upsert(record("A", "proc"), true);

        // Well past both the first and the refreshed deadline
        sleep(Duration::from_millis(20_000)).await;

        let left: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, RegistryEvent::Left { .. }))
            .cloned()
            .collect();
        assert_eq!(
            left,
            vec![RegistryEvent::Left {
                id: id("A"),
                reason: LeaveReason::Expired,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_cancels_pending_expiry() {
        let registry = ClientRegistry::new(TTL);
        let (events, _sub) = record_events(&registry);

        registry.upsert(record("A", "proc"), true);
        sleep(Duration::from_millis(100)).await;
        registry.upsert(record("A", "proc"), false);
        assert!(!registry.contains(&id("A")));

        sleep(Duration::from_millis(10_000)).await;

        let events = events.lock().unwrap();
        assert_eq!(
            events.last(),
            Some(&RegistryEvent::Left {
                id: id("A"),
                reason: LeaveReason::Departed,
            })
        );
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, RegistryEvent::Left { .. }))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_does_not_evict() {
        let registry = ClientRegistry::new(TTL);
        registry.upsert(record("A", "proc"), true);

        // Simulate an expiry that raced with a refresh and lost.
        registry.inner.expire(&id("A"), 0);

        assert!(registry.contains(&id("A")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_list_never_observes_partial_records() {
        let registry = ClientRegistry::new(Duration::from_secs(60));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for n in 0..500 {
                        let version = format!("v{}-{}", w, n);
                        registry.upsert(
                            ClientRecord::new(id("shared"), version.clone(), vec![version]),
                            true,
                        );
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..2000 {
                    for record in registry.list() {
                        assert_eq!(record.payload, vec![record.display_name.clone()]);
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for writer in writers {
            writer.await.unwrap();
        }
        reader.await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_leave_one_live_expiry() {
        let registry = ClientRegistry::new(Duration::from_millis(200));
        let (events, _sub) = record_events(&registry);

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        registry.upsert(record("A", "proc"), true);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(!registry.contains(&id("A")));
        let expired = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    RegistryEvent::Left {
                        reason: LeaveReason::Expired,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(expired, 1);
    }
}
