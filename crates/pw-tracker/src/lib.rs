//! Tracking, identity and persistence for discovered message listeners.
//!
//! The [`AggregationService`] owns all per-tab state. It judges novelty with
//! [`IdentityKey`], hides blocked records from observers, debounces durable
//! writes and resets tabs as navigation events arrive.

mod blocklist;
mod config;
mod identity;
mod lifecycle;
mod notify;
mod persist;
mod service;
mod store;

pub use blocklist::BlockListKind;
pub use blocklist::BlockRules;
pub use blocklist::BlocklistMatcher;
pub use blocklist::EXPORT_FORMAT_VERSION;
pub use config::DEFAULT_PERSIST_DEBOUNCE;
pub use config::TrackerConfig;
pub use identity::IdentityKey;
pub use identity::clean_url;
pub use identity::source_url;
pub use lifecycle::NavigationFlags;
pub use lifecycle::STATUS_COMPLETE;
pub use lifecycle::STATUS_LOADING;
pub use lifecycle::StatusOutcome;
pub use lifecycle::TabLifecycle;
pub use notify::NotificationCache;
pub use notify::ObserverChannel;
pub use persist::PersistenceManager;
pub use service::AggregationService;
pub use service::ObserveOutcome;
pub use service::TabDirectory;
pub use store::PersistedSnapshot;
pub use store::TabState;
pub use store::TrackingStore;
