//! Navigation flags deciding when a tab's listeners are reset.

use pw_core::TabId;
use std::collections::BTreeMap;

pub const STATUS_LOADING: &str = "loading";
pub const STATUS_COMPLETE: &str = "complete";

/// In-memory only; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavigationFlags {
    pub pending_push: bool,
    pub already_loading: bool,
}

/// What the aggregation service does after a tab status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// Records stay; observers are refreshed.
    Keep,
    /// Records and keys are dropped before the refresh.
    Clear,
    /// `complete`: nothing changes but observers are refreshed.
    Refresh,
}

#[derive(Debug, Clone, Default)]
pub struct TabLifecycle {
    flags: BTreeMap<TabId, NavigationFlags>,
}

impl TabLifecycle {
    pub fn flags(&self, tab_id: TabId) -> NavigationFlags {
        self.flags.get(&tab_id).copied().unwrap_or_default()
    }

    /// A same-document history push is in flight; the next status change keeps records.
    pub fn push_state(&mut self, tab_id: TabId) {
        self.flags.entry(tab_id).or_default().pending_push = true;
    }

    /// The page announced it is navigating away.
    pub fn page_changed(&mut self, tab_id: TabId) {
        if let Some(flags) = self.flags.get_mut(&tab_id) {
            flags.already_loading = false;
        }
    }

    pub fn status_changed(&mut self, tab_id: TabId, status: &str) -> StatusOutcome {
        if status == STATUS_COMPLETE {
            return StatusOutcome::Refresh;
        }

        let flags = self.flags.entry(tab_id).or_default();
        let outcome = if flags.pending_push {
            flags.pending_push = false;
            StatusOutcome::Keep
        } else if flags.already_loading {
            StatusOutcome::Keep
        } else {
            StatusOutcome::Clear
        };

        if status == STATUS_LOADING {
            flags.already_loading = true;
        }
        outcome
    }

    pub fn forget(&mut self, tab_id: TabId) {
        self.flags.remove(&tab_id);
    }

    pub fn is_tracked(&self, tab_id: TabId) -> bool {
        self.flags.contains_key(&tab_id)
    }
}
