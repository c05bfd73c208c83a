//! Shared primitives used across PortWatch crates.

use serde::Deserialize;
use serde::Serialize;

/// Result alias used across the workspace.
pub type WatchResult<T> = Result<T, WatchError>;

/// Browser tab identifier assigned by the host.
pub type TabId = u32;

/// Placeholder used whenever an enrichment step could not determine a value.
pub const UNKNOWN: &str = "unknown";

/// Source text reported for host-provided functions. Never a real listener.
pub const NATIVE_CODE_PLACEHOLDER: &str = "function () { [native code] }";

/// Top-level error type carrying a stable dotted code plus a human message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WatchError {
    pub code: &'static str,
    pub message: String,
}

impl WatchError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One observed registration of a cross-document message handler.
///
/// Field names on the wire follow the observation message emitted by the
/// instrumented page (`window`, `hops`, `stack`, `fullstack`, `listener`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRecord {
    #[serde(rename = "window", default)]
    pub window_label: String,
    #[serde(rename = "hops", default)]
    pub frame_path: String,
    #[serde(default)]
    pub domain: String,
    #[serde(rename = "stack", default)]
    pub source_stack_line: String,
    #[serde(rename = "fullstack", default)]
    pub full_stack_lines: Vec<String>,
    #[serde(rename = "listener")]
    pub code: String,
    /// Top-level URL of the owning tab. Left empty by the page side and
    /// filled by the aggregator from the tab it attributes the record to.
    #[serde(default)]
    pub parent_url: String,
}

impl ListenerRecord {
    /// Creates a record with every enrichment field set to "unknown".
    pub fn unknown(code: impl Into<String>) -> Self {
        Self {
            window_label: UNKNOWN.to_owned(),
            frame_path: UNKNOWN.to_owned(),
            domain: UNKNOWN.to_owned(),
            source_stack_line: String::new(),
            full_stack_lines: Vec::new(),
            code: code.into(),
            parent_url: String::new(),
        }
    }
}
