//! Operator settings persisted next to tracked listeners.

use crate::KeyValueStore;
use pw_core::WatchError;
use pw_core::WatchResult;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Durable key names.
pub mod keys {
    pub const TAB_LISTENERS: &str = "tab_listeners";
    pub const TAB_LISTENER_KEYS: &str = "tab_listener_keys";
    pub const DEDUPE_ENABLED: &str = "dedupe_enabled";
    pub const BLOCKED_LISTENERS: &str = "blocked_listeners";
    pub const BLOCKED_URLS: &str = "blocked_urls";
    pub const BLOCKED_REGEXES: &str = "blocked_regexes";
    pub const LOG_URL: &str = "log_url";
    pub const DISPLAY_PREFERENCES: &str = "display_preferences";
}

/// Presentation toggles stored for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPreferences {
    pub pretty_print: bool,
    pub highlight: bool,
    pub show_full_stack: bool,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            pretty_print: true,
            highlight: true,
            show_full_stack: false,
        }
    }
}

/// Every operator-controlled setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dedupe_enabled: bool,
    pub blocked_listeners: Vec<String>,
    pub blocked_urls: Vec<String>,
    pub blocked_regexes: Vec<String>,
    /// Empty disables external logging.
    pub log_url: String,
    pub display: DisplayPreferences,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dedupe_enabled: true,
            blocked_listeners: Vec::new(),
            blocked_urls: Vec::new(),
            blocked_regexes: Vec::new(),
            log_url: String::new(),
            display: DisplayPreferences::default(),
        }
    }
}

impl Settings {
    /// Loads settings, falling back per key when a stored value is unreadable.
    pub fn load(store: &dyn KeyValueStore) -> WatchResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            dedupe_enabled: load_key(store, keys::DEDUPE_ENABLED)?
                .unwrap_or(defaults.dedupe_enabled),
            blocked_listeners: load_key(store, keys::BLOCKED_LISTENERS)?.unwrap_or_default(),
            blocked_urls: load_key(store, keys::BLOCKED_URLS)?.unwrap_or_default(),
            blocked_regexes: load_key(store, keys::BLOCKED_REGEXES)?.unwrap_or_default(),
            log_url: load_key(store, keys::LOG_URL)?.unwrap_or_default(),
            display: load_key(store, keys::DISPLAY_PREFERENCES)?.unwrap_or(defaults.display),
        })
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) -> WatchResult<()> {
        store.set_many(&[
            (keys::DEDUPE_ENABLED, encode(&self.dedupe_enabled)?),
            (keys::BLOCKED_LISTENERS, encode(&self.blocked_listeners)?),
            (keys::BLOCKED_URLS, encode(&self.blocked_urls)?),
            (keys::BLOCKED_REGEXES, encode(&self.blocked_regexes)?),
            (keys::LOG_URL, encode(&self.log_url)?),
            (keys::DISPLAY_PREFERENCES, encode(&self.display)?),
        ])
    }

    pub fn log_endpoint(&self) -> Option<&str> {
        let trimmed = self.log_url.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

fn load_key<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> WatchResult<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            log::warn!("ignoring unreadable setting `{key}`: {error}");
            Ok(None)
        }
    }
}

fn encode<T: Serialize>(value: &T) -> WatchResult<String> {
    serde_json::to_string(value).map_err(|error| {
        WatchError::new(
            "storage.settings_encode_failed",
            format!("failed to encode setting: {error}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use super::keys;
    use crate::KeyValueStore;
    use crate::MemoryStore;

    #[test]
    fn missing_settings_load_as_defaults() {
        let store = MemoryStore::default();
        let settings = Settings::load(&store).unwrap_or_else(|_| unreachable!());
        assert_eq!(settings, Settings::default());
        assert!(settings.dedupe_enabled);
        assert_eq!(settings.log_endpoint(), None);
    }

    #[test]
    fn settings_roundtrip_through_store() {
        let mut store = MemoryStore::default();
        let settings = Settings {
            dedupe_enabled: false,
            blocked_regexes: vec!["eval".to_owned()],
            log_url: "https://collector.example/hook".to_owned(),
            ..Settings::default()
        };
        assert!(settings.save(&mut store).is_ok());

        let loaded = Settings::load(&store).unwrap_or_else(|_| unreachable!());
        assert_eq!(loaded, settings);
        assert_eq!(loaded.log_endpoint(), Some("https://collector.example/hook"));
    }

    #[test]
    fn unreadable_key_falls_back_without_failing() {
        let mut store = MemoryStore::default();
        assert!(store.set(keys::BLOCKED_URLS, "{not json").is_ok());
        assert!(store.set(keys::DEDUPE_ENABLED, "false").is_ok());

        let loaded = Settings::load(&store).unwrap_or_else(|_| unreachable!());
        assert!(loaded.blocked_urls.is_empty());
        assert!(!loaded.dedupe_enabled);
    }
}
