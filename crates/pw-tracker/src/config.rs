use pw_core::WatchError;
use pw_core::WatchResult;
use std::time::Duration;

pub const DEFAULT_PERSIST_DEBOUNCE: Duration = Duration::from_millis(500);
const MAX_PERSIST_DEBOUNCE: Duration = Duration::from_secs(60);

/// Aggregation service tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Quiet interval after the last mutation before state is written.
    pub persist_debounce: Duration,
    /// Used only when no dedupe setting has been stored yet.
    pub dedupe_by_default: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            persist_debounce: DEFAULT_PERSIST_DEBOUNCE,
            dedupe_by_default: true,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> WatchResult<()> {
        if self.persist_debounce > MAX_PERSIST_DEBOUNCE {
            return Err(WatchError::new(
                "tracker.persist_debounce_too_large",
                format!(
                    "persist debounce must not exceed {}s",
                    MAX_PERSIST_DEBOUNCE.as_secs()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TrackerConfig;
    use std::time::Duration;

    #[test]
    fn default_config_is_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.persist_debounce, Duration::from_millis(500));
    }

    #[test]
    fn oversized_debounce_is_rejected() {
        let config = TrackerConfig {
            persist_debounce: Duration::from_secs(3600),
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
