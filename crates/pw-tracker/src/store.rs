//! Per-tab ordered listener records plus the identity keys already seen.

use crate::identity::IdentityKey;
use pw_core::ListenerRecord;
use pw_core::TabId;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabState {
    records: Vec<ListenerRecord>,
    seen_keys: HashSet<IdentityKey>,
}

impl TabState {
    pub fn records(&self) -> &[ListenerRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_seen(&self, key: &IdentityKey) -> bool {
        self.seen_keys.contains(key)
    }

    fn clear(&mut self) {
        self.records.clear();
        self.seen_keys.clear();
    }
}

/// Durable form of the tracking store. Navigation flags are not part of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub tab_listeners: BTreeMap<TabId, Vec<ListenerRecord>>,
    pub tab_listener_keys: BTreeMap<TabId, Vec<IdentityKey>>,
}

#[derive(Debug, Clone)]
pub struct TrackingStore {
    tabs: BTreeMap<TabId, TabState>,
    dedupe: bool,
}

impl TrackingStore {
    pub fn new(dedupe: bool) -> Self {
        Self {
            tabs: BTreeMap::new(),
            dedupe,
        }
    }

    pub fn dedupe_enabled(&self) -> bool {
        self.dedupe
    }

    pub fn set_dedupe(&mut self, enabled: bool) {
        self.dedupe = enabled;
    }

    pub fn is_duplicate(&self, tab_id: TabId, record: &ListenerRecord) -> bool {
        self.dedupe
            && self
                .tabs
                .get(&tab_id)
                .is_some_and(|tab| tab.has_seen(&IdentityKey::of(record)))
    }

    /// Appends `record` and remembers its key. Returns false for a duplicate.
    pub fn record_observed(&mut self, tab_id: TabId, record: ListenerRecord) -> bool {
        if self.is_duplicate(tab_id, &record) {
            return false;
        }

        let key = IdentityKey::of(&record);
        let tab = self.tabs.entry(tab_id).or_default();
        tab.records.push(record);
        tab.seen_keys.insert(key);
        true
    }

    pub fn tab(&self, tab_id: TabId) -> Option<&TabState> {
        self.tabs.get(&tab_id)
    }

    pub fn records(&self, tab_id: TabId) -> &[ListenerRecord] {
        self.tabs
            .get(&tab_id)
            .map(|tab| tab.records.as_slice())
            .unwrap_or(&[])
    }

    pub fn tab_ids(&self) -> impl Iterator<Item = TabId> + '_ {
        self.tabs.keys().copied()
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.tabs.contains_key(&tab_id)
    }

    /// Empties the tab's records and keys. Returns whether anything was dropped.
    pub fn clear(&mut self, tab_id: TabId) -> bool {
        match self.tabs.get_mut(&tab_id) {
            Some(tab) if !tab.is_empty() || !tab.seen_keys.is_empty() => {
                tab.clear();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, tab_id: TabId) -> bool {
        self.tabs.remove(&tab_id).is_some()
    }

    pub fn snapshot(&self) -> PersistedSnapshot {
        let mut snapshot = PersistedSnapshot::default();
        for (tab_id, tab) in &self.tabs {
            snapshot.tab_listeners.insert(*tab_id, tab.records.clone());
            let mut keys: Vec<IdentityKey> = tab.seen_keys.iter().cloned().collect();
            keys.sort();
            snapshot.tab_listener_keys.insert(*tab_id, keys);
        }
        snapshot
    }

    /// Replaces all tab state with `snapshot`. Key lists become sets again.
    pub fn restore(&mut self, snapshot: PersistedSnapshot) {
        let PersistedSnapshot {
            tab_listeners,
            mut tab_listener_keys,
        } = snapshot;

        self.tabs.clear();
        for (tab_id, records) in tab_listeners {
            let seen_keys = match tab_listener_keys.remove(&tab_id) {
                Some(keys) => keys.into_iter().collect(),
                None => records.iter().map(IdentityKey::of).collect(),
            };
            self.tabs.insert(tab_id, TabState { records, seen_keys });
        }
        for (tab_id, keys) in tab_listener_keys {
            self.tabs.insert(
                tab_id,
                TabState {
                    records: Vec::new(),
                    seen_keys: keys.into_iter().collect(),
                },
            );
        }
    }
}
