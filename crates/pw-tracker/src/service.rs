//! Aggregation context: one event loop serving every tab.

use crate::blocklist::BlockListKind;
use crate::blocklist::BlockRules;
use crate::blocklist::BlocklistMatcher;
use crate::config::TrackerConfig;
use crate::lifecycle::StatusOutcome;
use crate::lifecycle::TabLifecycle;
use crate::notify::NotificationCache;
use crate::notify::ObserverChannel;
use crate::persist::PersistenceManager;
use crate::store::TrackingStore;
use pw_core::ListenerRecord;
use pw_core::NATIVE_CODE_PLACEHOLDER;
use pw_core::TabId;
use pw_core::WatchResult;
use pw_ipc::BridgeMessage;
use pw_ipc::InboundMessage;
use pw_ipc::LocalIpcEndpoint;
use pw_net::DisabledLogger;
use pw_net::EndpointUrl;
use pw_net::ListenerLogger;
use pw_net::LogShipper;
use pw_net::LogShipperConfig;
use pw_storage::KeyValueStore;
use pw_storage::Settings;
use pw_storage::keys;
use std::time::Duration;
use std::time::Instant;

const PAGE_LOG_TARGET: &str = "portwatch::page";

/// Host view of which tabs still exist.
pub trait TabDirectory {
    fn contains(&self, tab_id: TabId) -> bool;
}

/// What happened to one observed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// Native-code placeholder; never tracked.
    Ignored,
    Duplicate,
    Recorded { blocked: bool },
}

pub struct AggregationService {
    config: TrackerConfig,
    tracking: TrackingStore,
    lifecycle: TabLifecycle,
    notify: NotificationCache,
    persistence: PersistenceManager,
    settings: Settings,
    rules: BlockRules,
    matcher: BlocklistMatcher,
    logger: Box<dyn ListenerLogger>,
    tabs: Option<Box<dyn TabDirectory>>,
}

impl AggregationService {
    /// Loads settings and the persisted snapshot from `store`.
    ///
    /// Unreadable storage is logged and replaced by defaults.
    pub fn open(config: TrackerConfig, store: Box<dyn KeyValueStore>) -> WatchResult<Self> {
        config.validate()?;

        let mut settings = Settings::load(store.as_ref()).unwrap_or_else(|error| {
            log::warn!("using default settings: {error}");
            Settings::default()
        });
        if matches!(store.get(keys::DEDUPE_ENABLED), Ok(None)) {
            settings.dedupe_enabled = config.dedupe_by_default;
        }

        let persistence = PersistenceManager::new(store, config.persist_debounce);
        let mut tracking = TrackingStore::new(settings.dedupe_enabled);
        tracking.restore(persistence.load());

        let rules = BlockRules::from_settings(&settings);
        let matcher = BlocklistMatcher::compile(&rules);

        let mut service = Self {
            config,
            tracking,
            lifecycle: TabLifecycle::default(),
            notify: NotificationCache::default(),
            persistence,
            settings,
            rules,
            matcher,
            logger: Box::new(DisabledLogger),
            tabs: None,
        };
        service.recache_all();
        Ok(service)
    }

    pub fn with_logger(mut self, logger: Box<dyn ListenerLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_tab_directory(mut self, tabs: Box<dyn TabDirectory>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    /// Starts shipping to the stored `log_url`. Returns whether a shipper is running.
    pub fn connect_log_shipper(&mut self) -> WatchResult<bool> {
        let Some(endpoint) = self.settings.log_endpoint() else {
            self.logger = Box::new(DisabledLogger);
            return Ok(false);
        };
        let shipper = LogShipper::spawn(LogShipperConfig::for_endpoint(endpoint))?;
        log::debug!("shipping listeners to {}", shipper.endpoint().as_str());
        self.logger = Box::new(shipper);
        Ok(true)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn rules(&self) -> &BlockRules {
        &self.rules
    }

    pub fn tracking(&self) -> &TrackingStore {
        &self.tracking
    }

    pub fn lifecycle(&self) -> &TabLifecycle {
        &self.lifecycle
    }

    pub fn notifications(&self) -> &NotificationCache {
        &self.notify
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    /// Handles one bridge message to completion. Returns false on shutdown.
    pub fn handle(&mut self, message: BridgeMessage, now: Instant) -> bool {
        match message {
            BridgeMessage::Observation {
                tab_id,
                tab_url,
                message,
            } => self.handle_observation(tab_id, tab_url, message, now),
            BridgeMessage::TabUpdated { tab_id, status } => {
                self.tab_updated(tab_id, &status, now);
            }
            BridgeMessage::TabActivated { tab_id } => self.tab_activated(tab_id),
            BridgeMessage::TabRemoved { tab_id } => self.remove_tab(tab_id, now),
            BridgeMessage::Update(_) => {
                log::debug!("ignoring observer update sent to the aggregator");
            }
            BridgeMessage::Shutdown => {
                self.flush();
                return false;
            }
        }
        true
    }

    /// Handles everything already queued on `endpoint` without waiting.
    pub fn pump(&mut self, endpoint: &LocalIpcEndpoint) -> usize {
        let mut handled = 0;
        for message in endpoint.drain_messages() {
            match message {
                Ok(message) => {
                    handled += 1;
                    if !self.handle(message, Instant::now()) {
                        break;
                    }
                }
                Err(error) => log::warn!("dropping undecodable bridge message: {error}"),
            }
        }
        self.tick(Instant::now());
        handled
    }

    /// Blocks on `endpoint` until shutdown or disconnect, flushing on the way out.
    pub fn run(&mut self, endpoint: &LocalIpcEndpoint) {
        let wait = self.config.persist_debounce.max(Duration::from_millis(10));
        loop {
            match endpoint.recv_message_timeout(wait) {
                Ok(message) => {
                    if !self.handle(message, Instant::now()) {
                        return;
                    }
                }
                Err(error) if error.code == "ipc.recv_timeout" => {}
                Err(error) => {
                    log::debug!("aggregator endpoint closed: {error}");
                    break;
                }
            }
            self.tick(Instant::now());
        }
        self.flush();
    }

    fn handle_observation(
        &mut self,
        tab_id: TabId,
        tab_url: Option<String>,
        message: InboundMessage,
        now: Instant,
    ) {
        if let Some(url) = &tab_url {
            self.notify.set_tab_url(tab_id, url.clone());
        }
        if let Some(line) = &message.log {
            log::debug!(target: PAGE_LOG_TARGET, "tab {tab_id}: {line}");
        }
        if message.is_push_state() {
            self.lifecycle.push_state(tab_id);
        }
        if message.is_change_page() {
            self.lifecycle.page_changed(tab_id);
        }
        if let Some(record) = message.to_record(tab_url.as_deref()) {
            self.observe(tab_id, record, now);
        }
    }

    pub fn observe(&mut self, tab_id: TabId, record: ListenerRecord, now: Instant) -> ObserveOutcome {
        if record.code == NATIVE_CODE_PLACEHOLDER {
            return ObserveOutcome::Ignored;
        }
        if self.tracking.is_duplicate(tab_id, &record) {
            log::debug!("tab {tab_id}: duplicate listener ignored");
            return ObserveOutcome::Duplicate;
        }

        let blocked = self.matcher.is_blocked(&record);
        if !blocked {
            self.logger.ship(&record);
        }
        self.tracking.record_observed(tab_id, record);
        self.persistence.mark_dirty(now);
        self.refresh(tab_id);
        ObserveOutcome::Recorded { blocked }
    }

    pub fn tab_updated(&mut self, tab_id: TabId, status: &str, now: Instant) -> StatusOutcome {
        let outcome = self.lifecycle.status_changed(tab_id, status);
        if outcome == StatusOutcome::Clear && self.tracking.clear(tab_id) {
            log::debug!("tab {tab_id}: navigation cleared listeners");
            self.persistence.mark_dirty(now);
        }
        self.refresh(tab_id);
        outcome
    }

    pub fn tab_activated(&mut self, tab_id: TabId) {
        self.notify.select(tab_id);
        self.refresh(tab_id);
    }

    /// Destroys records, keys, navigation flags and the cached snapshot.
    pub fn remove_tab(&mut self, tab_id: TabId, now: Instant) {
        if self.tracking.remove(tab_id) {
            self.persistence.mark_dirty(now);
        }
        self.lifecycle.forget(tab_id);
        self.notify.forget(tab_id);
        self.notify.broadcast();
    }

    fn refresh(&mut self, tab_id: TabId) {
        let missing = self
            .tabs
            .as_ref()
            .is_some_and(|tabs| !tabs.contains(tab_id));
        if missing {
            log::debug!("tab {tab_id} vanished; dropping its state");
            self.remove_tab(tab_id, Instant::now());
            return;
        }

        let visible = self.visible(tab_id);
        self.notify.update_tab(tab_id, visible);
        self.notify.broadcast();
    }

    fn recache_all(&mut self) {
        let tab_ids: Vec<TabId> = self.tracking.tab_ids().collect();
        for tab_id in tab_ids {
            let visible = self.visible(tab_id);
            self.notify.update_tab(tab_id, visible);
        }
    }

    /// Records of `tab_id` that no block rule hides.
    pub fn visible(&self, tab_id: TabId) -> Vec<ListenerRecord> {
        self.tracking
            .records(tab_id)
            .iter()
            .filter(|record| !self.matcher.is_blocked(record))
            .cloned()
            .collect()
    }

    /// Badge value for a tab.
    pub fn visible_count(&self, tab_id: TabId) -> usize {
        self.tracking
            .records(tab_id)
            .iter()
            .filter(|record| !self.matcher.is_blocked(record))
            .count()
    }

    pub fn connect_observer(&mut self, observer: Box<dyn ObserverChannel>) {
        self.notify.connect(observer);
    }

    pub fn tick(&mut self, now: Instant) -> bool {
        self.persistence.tick(now, &self.tracking)
    }

    pub fn flush(&mut self) -> bool {
        self.persistence.flush(&self.tracking)
    }

    pub fn set_dedupe(&mut self, enabled: bool) -> WatchResult<()> {
        let mut settings = self.settings.clone();
        settings.dedupe_enabled = enabled;
        self.commit_settings(settings)?;
        self.tracking.set_dedupe(enabled);
        Ok(())
    }

    /// Accepts an empty URL (disables shipping) or an http(s) endpoint.
    pub fn set_log_url(&mut self, url: &str) -> WatchResult<()> {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            EndpointUrl::parse(trimmed)?;
        }
        let mut settings = self.settings.clone();
        settings.log_url = trimmed.to_owned();
        self.commit_settings(settings)
    }

    pub fn block(&mut self, kind: BlockListKind, value: &str) -> WatchResult<bool> {
        let added = self.rules.add(kind, value);
        if added {
            self.rules_changed()?;
        }
        Ok(added)
    }

    pub fn unblock(&mut self, kind: BlockListKind, value: &str) -> WatchResult<bool> {
        let removed = self.rules.remove(kind, value);
        if removed {
            self.rules_changed()?;
        }
        Ok(removed)
    }

    pub fn export_rules(&self, kind: BlockListKind) -> WatchResult<String> {
        self.rules.export(kind)
    }

    pub fn import_rules(&mut self, kind: BlockListKind, document: &str) -> WatchResult<usize> {
        let added = self.rules.import(kind, document)?;
        if added > 0 {
            self.rules_changed()?;
        }
        Ok(added)
    }

    fn rules_changed(&mut self) -> WatchResult<()> {
        self.matcher = BlocklistMatcher::compile(&self.rules);
        self.rules.apply_to(&mut self.settings);
        self.recache_all();
        self.notify.broadcast();
        self.save_settings()
    }

    fn save_settings(&mut self) -> WatchResult<()> {
        self.settings.save(self.persistence.store_mut())
    }

    /// Persists `settings` and adopts them only once the store accepted the write.
    fn commit_settings(&mut self, settings: Settings) -> WatchResult<()> {
        settings.save(self.persistence.store_mut())?;
        self.settings = settings;
        Ok(())
    }
}
