//! Debounced durable writes of the tracking store.

use crate::store::PersistedSnapshot;
use crate::store::TrackingStore;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_storage::KeyValueStore;
use pw_storage::keys;
use serde::de::DeserializeOwned;
use std::time::Duration;
use std::time::Instant;

/// Dirty-flag write buffer over a [`KeyValueStore`]. Each write is a full snapshot.
pub struct PersistenceManager {
    store: Box<dyn KeyValueStore>,
    debounce: Duration,
    dirty: bool,
    deadline: Option<Instant>,
}

impl PersistenceManager {
    pub fn new(store: Box<dyn KeyValueStore>, debounce: Duration) -> Self {
        Self {
            store,
            debounce,
            dirty: false,
            deadline: None,
        }
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn KeyValueStore {
        self.store.as_mut()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Reads the persisted snapshot; unreadable state starts empty.
    pub fn load(&self) -> PersistedSnapshot {
        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!("starting with empty listener state: {error}");
                PersistedSnapshot::default()
            }
        }
    }

    fn try_load(&self) -> WatchResult<PersistedSnapshot> {
        Ok(PersistedSnapshot {
            tab_listeners: read_json(self.store.as_ref(), keys::TAB_LISTENERS)?
                .unwrap_or_default(),
            tab_listener_keys: read_json(self.store.as_ref(), keys::TAB_LISTENER_KEYS)?
                .unwrap_or_default(),
        })
    }

    /// Re-arms the quiet interval.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.dirty = true;
        self.deadline = Some(now + self.debounce);
    }

    /// Writes once the quiet interval has elapsed. Returns whether a write succeeded.
    pub fn tick(&mut self, now: Instant, tracking: &TrackingStore) -> bool {
        match self.deadline {
            Some(deadline) if self.dirty && now >= deadline => self.write(now, tracking),
            _ => false,
        }
    }

    /// Writes immediately when there is anything pending.
    pub fn flush(&mut self, tracking: &TrackingStore) -> bool {
        if !self.dirty {
            return false;
        }
        self.write(Instant::now(), tracking)
    }

    fn write(&mut self, now: Instant, tracking: &TrackingStore) -> bool {
        match save_snapshot(self.store.as_mut(), &tracking.snapshot()) {
            Ok(()) => {
                self.dirty = false;
                self.deadline = None;
                true
            }
            Err(error) => {
                log::warn!("listener state write failed, retrying: {error}");
                self.deadline = Some(now + self.debounce);
                false
            }
        }
    }
}

fn save_snapshot(store: &mut dyn KeyValueStore, snapshot: &PersistedSnapshot) -> WatchResult<()> {
    store.set_many(&[
        (keys::TAB_LISTENERS, encode(&snapshot.tab_listeners)?),
        (keys::TAB_LISTENER_KEYS, encode(&snapshot.tab_listener_keys)?),
    ])
}

fn encode<T: serde::Serialize>(value: &T) -> WatchResult<String> {
    serde_json::to_string(value).map_err(|error| {
        WatchError::new(
            "tracker.snapshot_encode_failed",
            format!("failed to encode listener snapshot: {error}"),
        )
    })
}

fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> WatchResult<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw).map(Some).map_err(|error| {
        WatchError::new(
            "tracker.snapshot_decode_failed",
            format!("stored `{key}` is unreadable: {error}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::PersistenceManager;
    use crate::store::TrackingStore;
    use pw_core::ListenerRecord;
    use pw_core::WatchError;
    use pw_core::WatchResult;
    use pw_storage::KeyValueStore;
    use pw_storage::MemoryStore;
    use pw_storage::keys;
    use std::time::Duration;
    use std::time::Instant;

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> WatchResult<Option<String>> {
            Err(WatchError::new("storage.read_failed", "offline"))
        }

        fn set(&mut self, _key: &str, _value: &str) -> WatchResult<()> {
            Err(WatchError::new("storage.write_failed", "offline"))
        }

        fn remove(&mut self, _key: &str) -> WatchResult<()> {
            Ok(())
        }
    }

    fn populated() -> TrackingStore {
        let mut tracking = TrackingStore::new(true);
        tracking.record_observed(9, ListenerRecord::unknown("function a(e){}"));
        tracking
    }

    #[test]
    fn writes_only_after_quiet_interval() {
        let mut manager =
            PersistenceManager::new(Box::new(MemoryStore::default()), Duration::from_millis(500));
        let tracking = populated();
        let start = Instant::now();

        manager.mark_dirty(start);
        assert!(!manager.tick(start + Duration::from_millis(100), &tracking));
        manager.mark_dirty(start + Duration::from_millis(400));
        assert!(!manager.tick(start + Duration::from_millis(600), &tracking));
        assert!(manager.tick(start + Duration::from_millis(900), &tracking));
        assert!(!manager.is_dirty());

        assert!(manager.store().get(keys::TAB_LISTENERS).is_ok_and(|raw| raw.is_some()));
        assert_eq!(manager.load(), tracking.snapshot());
    }

    #[test]
    fn failed_save_stays_dirty_and_failed_load_starts_empty() {
        let mut manager = PersistenceManager::new(Box::new(FailingStore), Duration::ZERO);
        assert!(manager.load().tab_listeners.is_empty());

        manager.mark_dirty(Instant::now());
        assert!(!manager.flush(&populated()));
        assert!(manager.is_dirty());
        assert!(manager.deadline().is_some());
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let mut store = MemoryStore::default();
        store
            .set(keys::TAB_LISTENERS, "{not json")
            .unwrap_or_else(|_| unreachable!());
        let manager = PersistenceManager::new(Box::new(store), Duration::ZERO);
        assert!(manager.load().tab_listeners.is_empty());
    }
}
