//! Operator block rules and the compiled matcher built from them.

use crate::identity::clean_url;
use crate::identity::source_url;
use chrono::SecondsFormat;
use chrono::Utc;
use pw_core::ListenerRecord;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_storage::Settings;
use regex::Regex;
use regex::RegexBuilder;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashSet;

pub const EXPORT_FORMAT_VERSION: &str = "1.0";

/// Which user-authored list a rule lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockListKind {
    Code,
    Url,
    Pattern,
}

impl BlockListKind {
    /// Key used in export documents.
    pub fn export_key(self) -> &'static str {
        match self {
            Self::Code => "blockedListeners",
            Self::Url => "blockedUrls",
            Self::Pattern => "blockedRegexes",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "code" | "listener" | "blockedListeners" => Some(Self::Code),
            "url" | "blockedUrls" => Some(Self::Url),
            "pattern" | "regex" | "blockedRegexes" => Some(Self::Pattern),
            _ => None,
        }
    }
}

/// The three ordered rule lists as the operator wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockRules {
    pub codes: Vec<String>,
    pub urls: Vec<String>,
    pub patterns: Vec<String>,
}

impl BlockRules {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            codes: settings.blocked_listeners.clone(),
            urls: settings.blocked_urls.clone(),
            patterns: settings.blocked_regexes.clone(),
        }
    }

    pub fn apply_to(&self, settings: &mut Settings) {
        settings.blocked_listeners = self.codes.clone();
        settings.blocked_urls = self.urls.clone();
        settings.blocked_regexes = self.patterns.clone();
    }

    pub fn list(&self, kind: BlockListKind) -> &[String] {
        match kind {
            BlockListKind::Code => &self.codes,
            BlockListKind::Url => &self.urls,
            BlockListKind::Pattern => &self.patterns,
        }
    }

    fn list_mut(&mut self, kind: BlockListKind) -> &mut Vec<String> {
        match kind {
            BlockListKind::Code => &mut self.codes,
            BlockListKind::Url => &mut self.urls,
            BlockListKind::Pattern => &mut self.patterns,
        }
    }

    /// Appends a rule unless an identical one exists. Returns whether it was added.
    pub fn add(&mut self, kind: BlockListKind, value: &str) -> bool {
        let list = self.list_mut(kind);
        if list.iter().any(|existing| existing == value) {
            return false;
        }
        list.push(value.to_owned());
        true
    }

    pub fn remove(&mut self, kind: BlockListKind, value: &str) -> bool {
        let list = self.list_mut(kind);
        let before = list.len();
        list.retain(|existing| existing != value);
        list.len() != before
    }

    /// Serializes one list as `{<kind>: [...], exportDate, version}`.
    pub fn export(&self, kind: BlockListKind) -> WatchResult<String> {
        let mut document = Map::new();
        document.insert(
            kind.export_key().to_owned(),
            Value::from(self.list(kind).to_vec()),
        );
        document.insert(
            "exportDate".to_owned(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        document.insert(
            "version".to_owned(),
            Value::from(EXPORT_FORMAT_VERSION),
        );

        serde_json::to_string_pretty(&Value::Object(document)).map_err(|error| {
            WatchError::new(
                "blocklist.export_encode_failed",
                format!("failed to encode block list export: {error}"),
            )
        })
    }

    /// Merges an exported list into `kind`, skipping entries already present.
    ///
    /// Returns the number of rules added.
    pub fn import(&mut self, kind: BlockListKind, document: &str) -> WatchResult<usize> {
        let parsed: Value = serde_json::from_str(document).map_err(|error| {
            WatchError::new(
                "blocklist.import_invalid_json",
                format!("block list import is not valid JSON: {error}"),
            )
        })?;

        let version = parsed.get("version").and_then(Value::as_str);
        if version != Some(EXPORT_FORMAT_VERSION) {
            return Err(WatchError::new(
                "blocklist.import_version_unsupported",
                format!(
                    "expected export version {EXPORT_FORMAT_VERSION}, found {}",
                    version.unwrap_or("none")
                ),
            ));
        }

        let entries = parsed
            .get(kind.export_key())
            .and_then(Value::as_array)
            .ok_or_else(|| {
                WatchError::new(
                    "blocklist.import_kind_missing",
                    format!("import file has no `{}` list", kind.export_key()),
                )
            })?;

        let mut added = 0;
        for entry in entries {
            let Some(value) = entry.as_str() else {
                log::warn!("skipping non-string block rule in import");
                continue;
            };
            if self.add(kind, value) {
                added += 1;
            }
        }
        Ok(added)
    }
}

/// Compiled, read-only view of the block rules.
#[derive(Debug, Clone, Default)]
pub struct BlocklistMatcher {
    codes: HashSet<String>,
    urls: HashSet<String>,
    patterns: Vec<Regex>,
}

impl BlocklistMatcher {
    pub fn compile(rules: &BlockRules) -> Self {
        let patterns = rules
            .patterns
            .iter()
            .filter_map(|pattern| {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(regex) => Some(regex),
                    Err(error) => {
                        log::warn!("dropping invalid block pattern `{pattern}`: {error}");
                        None
                    }
                }
            })
            .collect();

        Self {
            codes: rules.codes.iter().cloned().collect(),
            urls: rules.urls.iter().map(|url| clean_url(url)).collect(),
            patterns,
        }
    }

    pub fn is_blocked(&self, record: &ListenerRecord) -> bool {
        self.codes.contains(&record.code)
            || (!self.urls.is_empty() && self.urls.contains(&source_url(record)))
            || self.patterns.iter().any(|pattern| pattern.is_match(&record.code))
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}
