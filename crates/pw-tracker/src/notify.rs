//! Latest visible listeners per tab, pushed to connected observers.

use chrono::Utc;
use pw_core::ListenerRecord;
use pw_core::TabId;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_ipc::BridgeMessage;
use pw_ipc::LocalIpcEndpoint;
use pw_ipc::ObserverUpdate;
use std::collections::BTreeMap;
use std::sync::mpsc;

/// Transient connection to an observer (for example an open popup).
pub trait ObserverChannel {
    /// Fails once the observer has gone away.
    fn push(&self, update: &ObserverUpdate) -> WatchResult<()>;
}

impl ObserverChannel for LocalIpcEndpoint {
    fn push(&self, update: &ObserverUpdate) -> WatchResult<()> {
        self.send_message(&BridgeMessage::Update(update.clone()))
    }
}

impl ObserverChannel for mpsc::Sender<ObserverUpdate> {
    fn push(&self, update: &ObserverUpdate) -> WatchResult<()> {
        self.send(update.clone()).map_err(|_| {
            WatchError::new("notify.observer_closed", "observer channel is closed")
        })
    }
}

#[derive(Default)]
pub struct NotificationCache {
    listeners: BTreeMap<TabId, Vec<ListenerRecord>>,
    tab_urls: BTreeMap<TabId, String>,
    current_tab: Option<TabId>,
    observers: Vec<Box<dyn ObserverChannel>>,
}

impl NotificationCache {
    /// Stores the visible records for a tab without notifying anyone.
    pub fn update_tab(&mut self, tab_id: TabId, visible: Vec<ListenerRecord>) {
        self.listeners.insert(tab_id, visible);
    }

    pub fn set_tab_url(&mut self, tab_id: TabId, url: impl Into<String>) {
        self.tab_urls.insert(tab_id, url.into());
    }

    pub fn select(&mut self, tab_id: TabId) {
        self.current_tab = Some(tab_id);
    }

    pub fn current_tab(&self) -> Option<TabId> {
        self.current_tab
    }

    pub fn visible(&self, tab_id: TabId) -> &[ListenerRecord] {
        self.listeners
            .get(&tab_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn forget(&mut self, tab_id: TabId) {
        self.listeners.remove(&tab_id);
        self.tab_urls.remove(&tab_id);
        if self.current_tab == Some(tab_id) {
            self.current_tab = None;
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Registers an observer and sends it the cached snapshot right away.
    pub fn connect(&mut self, observer: Box<dyn ObserverChannel>) {
        let update = self.snapshot(true);
        match observer.push(&update) {
            Ok(()) => self.observers.push(observer),
            Err(error) => log::debug!("observer closed before first update: {error}"),
        }
    }

    /// Pushes the current state to every live observer, dropping closed ones.
    pub fn broadcast(&mut self) {
        if self.observers.is_empty() {
            return;
        }

        let update = self.snapshot(false);
        self.observers.retain(|observer| match observer.push(&update) {
            Ok(()) => true,
            Err(error) => {
                log::debug!("dropping closed observer: {error}");
                false
            }
        });
    }

    pub fn snapshot(&self, cached: bool) -> ObserverUpdate {
        let current_url = self
            .current_tab
            .and_then(|tab_id| self.tab_urls.get(&tab_id))
            .cloned()
            .unwrap_or_default();

        ObserverUpdate {
            listeners: self.listeners.clone(),
            current_url,
            cached,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::NotificationCache;
    use pw_core::ListenerRecord;
    use std::sync::mpsc;

    #[test]
    fn connect_sends_cached_snapshot() {
        let mut cache = NotificationCache::default();
        cache.update_tab(1, vec![ListenerRecord::unknown("function a(e){}")]);
        cache.set_tab_url(1, "https://a.example/");
        cache.select(1);

        let (tx, rx) = mpsc::channel();
        cache.connect(Box::new(tx));
        let update = rx.try_recv().unwrap_or_else(|_| unreachable!());
        assert!(update.cached);
        assert_eq!(update.current_url, "https://a.example/");
        assert_eq!(update.listeners.get(&1).map(Vec::len), Some(1));
        assert!(update.timestamp > 0);
    }

    #[test]
    fn closed_observers_are_dropped_on_broadcast() {
        let mut cache = NotificationCache::default();
        let (live_tx, live_rx) = mpsc::channel();
        let (dead_tx, dead_rx) = mpsc::channel();
        cache.connect(Box::new(live_tx));
        cache.connect(Box::new(dead_tx));
        assert_eq!(cache.observer_count(), 2);
        drop(dead_rx);

        cache.update_tab(2, Vec::new());
        cache.broadcast();
        assert_eq!(cache.observer_count(), 1);

        let pushed: Vec<_> = live_rx.try_iter().collect();
        assert_eq!(pushed.len(), 2);
        assert!(!pushed[1].cached);
    }

    #[test]
    fn forget_clears_tab_and_selection() {
        let mut cache = NotificationCache::default();
        cache.update_tab(3, vec![ListenerRecord::unknown("function a(e){}")]);
        cache.select(3);
        cache.forget(3);
        assert!(cache.visible(3).is_empty());
        assert_eq!(cache.current_tab(), None);
    }
}
