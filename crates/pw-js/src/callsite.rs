//! Picks the registering call site out of a captured stack trace.

use regex::Regex;

/// Lines between the capture point and the registering caller: the error
/// header, the capture helper, and the hooked entry point.
pub const DEFAULT_BASE_OFFSET: usize = 3;

/// jQuery's dispatcher registers from inside `jQuery.fn.init.on`.
pub const JQUERY_DISPATCH_MARKER: &str = r"init\.on|init\..*on\]";

/// Source of stack text at the moment of registration.
pub trait StackSource {
    fn capture(&self) -> Option<String>;
}

/// Stack text captured ahead of time by the engine hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStack(pub Option<String>);

impl StackSource for CapturedStack {
    fn capture(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSite {
    pub line: String,
    pub full: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSiteLocator {
    base_offset: usize,
}

impl Default for CallSiteLocator {
    fn default() -> Self {
        Self {
            base_offset: DEFAULT_BASE_OFFSET,
        }
    }
}

impl CallSiteLocator {
    pub fn new(base_offset: usize) -> Self {
        Self { base_offset }
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Never fails: a missing or short stack yields an empty line.
    pub fn locate(&self, stack: &dyn StackSource, extra_offset: usize, marker: Option<&Regex>) -> CallSite {
        let Some(text) = stack.capture() else {
            return CallSite::default();
        };
        let full = split_stack(&text);

        let line = match marker {
            Some(marker) => full
                .iter()
                .position(|line| marker.is_match(line))
                .and_then(|index| full.get(index + 1)),
            None => full.get(self.base_offset.saturating_add(extra_offset)),
        };

        CallSite {
            line: line.cloned().unwrap_or_default(),
            full,
        }
    }
}

pub fn split_stack(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    text.split('\n')
        .map(|line| line.trim().to_owned())
        .collect()
}

pub fn jquery_marker() -> Option<Regex> {
    Regex::new(JQUERY_DISPATCH_MARKER).ok()
}

#[cfg(test)]
mod tests {
    use super::CallSiteLocator;
    use super::CapturedStack;
    use super::jquery_marker;
    use super::split_stack;

    const STACK: &str = "Error\n    at observe (hook.js:1:1)\n    at addEventListener (hook.js:9:3)\n    at init (https://app.example/main.js:10:5)\n    at boot (https://app.example/main.js:40:1)";

    fn stack(text: &str) -> CapturedStack {
        CapturedStack(Some(text.to_owned()))
    }

    #[test]
    fn selects_line_at_base_offset() {
        let site = CallSiteLocator::default().locate(&stack(STACK), 0, None);
        assert_eq!(site.line, "at init (https://app.example/main.js:10:5)");
        assert_eq!(site.full.len(), 5);
        assert_eq!(site.full[1], "at observe (hook.js:1:1)");
    }

    #[test]
    fn unwrap_offset_shifts_selection() {
        let site = CallSiteLocator::default().locate(&stack(STACK), 1, None);
        assert_eq!(site.line, "at boot (https://app.example/main.js:40:1)");
    }

    #[test]
    fn short_stack_yields_empty_line_but_keeps_full_stack() {
        let site = CallSiteLocator::default().locate(&stack(STACK), 9, None);
        assert_eq!(site.line, "");
        assert_eq!(site.full.len(), 5);
    }

    #[test]
    fn missing_stack_degrades_to_empty() {
        let site = CallSiteLocator::default().locate(&CapturedStack(None), 0, None);
        assert_eq!(site.line, "");
        assert!(site.full.is_empty());
        assert!(split_stack("   ").is_empty());
    }

    #[test]
    fn marker_selects_following_line() {
        let text = "Error\n at a (x.js:1:1)\n at jQuery.fn.init.on (jquery.js:3:1)\n at setup (https://app.example/app.js:7:2)";
        let marker = jquery_marker();
        assert!(marker.is_some());
        let site = CallSiteLocator::default().locate(&stack(text), 0, marker.as_ref());
        assert_eq!(site.line, "at setup (https://app.example/app.js:7:2)");
    }

    #[test]
    fn marker_without_match_yields_empty_line() {
        let marker = jquery_marker();
        let site = CallSiteLocator::default().locate(&stack(STACK), 0, marker.as_ref());
        assert_eq!(site.line, "");
    }
}
