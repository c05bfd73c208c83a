//! Stable identity of a listener record across repeated registrations.

use pw_core::ListenerRecord;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

const KEY_SEPARATOR: char = '|';

static PARENTHESIZED_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\(([A-Za-z][A-Za-z0-9+.-]*://[^()\s]+)\)").ok());
static BARE_URL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9+.-]*://[^()\s]+").ok());

/// Drops the query, the fragment and any trailing `:line[:column]` suffix.
///
/// Only the last path segment is inspected, so an authority port survives.
pub fn clean_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_query = trimmed
        .find(['?', '#'])
        .map_or(trimmed, |index| &trimmed[..index]);

    let path_start = match without_query.find("://") {
        Some(scheme_end) => {
            let authority_start = scheme_end + 3;
            match without_query[authority_start..].find('/') {
                Some(offset) => authority_start + offset,
                None => return without_query.to_owned(),
            }
        }
        None => 0,
    };
    let segment_start = without_query[path_start..]
        .rfind('/')
        .map_or(path_start, |offset| path_start + offset + 1);

    let mut end = without_query.len();
    while let Some(colon) = without_query[segment_start..end].rfind(':') {
        let digits = &without_query[segment_start + colon + 1..end];
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            break;
        }
        end = segment_start + colon;
    }

    without_query[..end].to_owned()
}

/// Source URL of the script that registered the handler, already cleaned.
///
/// Parenthesized stack locations win over bare URLs; when the stack holds no
/// URL at all the source stack line itself stands in.
pub fn source_url(record: &ListenerRecord) -> String {
    let joined = record.full_stack_lines.join("\n");
    let found = first_capture(&PARENTHESIZED_URL, &joined)
        .or_else(|| first_match(&BARE_URL, &joined))
        .or_else(|| first_capture(&PARENTHESIZED_URL, &record.source_stack_line))
        .or_else(|| first_match(&BARE_URL, &record.source_stack_line));

    match found {
        Some(url) => clean_url(url),
        None => clean_url(&record.source_stack_line),
    }
}

fn first_capture<'a>(pattern: &LazyLock<Option<Regex>>, text: &'a str) -> Option<&'a str> {
    let pattern = pattern.as_ref()?;
    pattern
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|url| url.as_str())
}

fn first_match<'a>(pattern: &LazyLock<Option<Regex>>, text: &'a str) -> Option<&'a str> {
    let pattern = pattern.as_ref()?;
    pattern.find(text).map(|url| url.as_str())
}

/// `cleanedSourceUrl|framePath|domain|code`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn of(record: &ListenerRecord) -> Self {
        let mut key = source_url(record);
        for part in [&record.frame_path, &record.domain, &record.code] {
            key.push(KEY_SEPARATOR);
            key.push_str(part);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::IdentityKey;
    use super::clean_url;
    use super::source_url;
    use pw_core::ListenerRecord;

    fn record(stack: &[&str], code: &str) -> ListenerRecord {
        let mut record = ListenerRecord::unknown(code);
        record.full_stack_lines = stack.iter().map(|line| (*line).to_owned()).collect();
        record.source_stack_line = stack.get(3).copied().unwrap_or_default().to_owned();
        record.frame_path = "top".to_owned();
        record.domain = "a.example".to_owned();
        record
    }

    #[test]
    fn strips_location_suffix_query_and_fragment() {
        assert_eq!(clean_url("https://a.example/app.js:12:7"), "https://a.example/app.js");
        assert_eq!(clean_url("https://a.example/app.js:12"), "https://a.example/app.js");
        assert_eq!(
            clean_url("https://a.example/app.js?v=3#frag"),
            "https://a.example/app.js"
        );
        assert_eq!(
            clean_url("https://a.example:8443/app.js?cache=1:4:2"),
            "https://a.example:8443/app.js"
        );
        assert_eq!(clean_url("https://a.example:8443"), "https://a.example:8443");
    }

    #[test]
    fn cleaning_is_idempotent() {
        for input in [
            "https://a.example/app.js:12:7",
            "https://a.example/x:1:2:3",
            "https://a.example:8443/",
            "jQuery",
            "",
            "at onMessage (eval)",
        ] {
            let once = clean_url(input);
            assert_eq!(clean_url(&once), once, "input {input}");
        }
    }

    #[test]
    fn parenthesized_url_wins_over_bare_url() {
        let record = record(
            &[
                "Error",
                "at https://bare.example/first.js:1:1",
                "at hook (https://paren.example/second.js:5:9)",
            ],
            "function(e){}",
        );
        assert_eq!(source_url(&record), "https://paren.example/second.js");
    }

    #[test]
    fn falls_back_to_stack_line_without_urls() {
        let mut record = record(&[], "function(e){}");
        record.source_stack_line = "jQuery".to_owned();
        assert_eq!(source_url(&record), "jQuery");
    }

    #[test]
    fn key_ignores_location_within_script() {
        let first = record(
            &["Error", "a", "b", "at x (https://a.example/app.js:10:2)"],
            "function onMessage(e){}",
        );
        let second = record(
            &["Error", "a", "b", "at x (https://a.example/app.js:99:1)"],
            "function onMessage(e){}",
        );
        assert_eq!(IdentityKey::of(&first), IdentityKey::of(&second));
        assert_eq!(
            IdentityKey::of(&first).as_str(),
            "https://a.example/app.js|top|a.example|function onMessage(e){}"
        );

        let mut other_frame = first.clone();
        other_frame.frame_path = "top.frames[0]".to_owned();
        assert_ne!(IdentityKey::of(&first), IdentityKey::of(&other_frame));
    }
}
