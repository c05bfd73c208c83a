//! Wrapper signature detection for third-party instrumentation libraries.

use crate::handler::HandlerValue;
use pw_core::WatchError;
use pw_core::WatchResult;
use regex::Regex;
use regex::RegexBuilder;

/// Known wrapper families. `Custom` covers entries registered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WrapperShape {
    Raven,
    NewRelic,
    Rollbar,
    Bugsnag,
    Sentry,
    BugsnagLegacy,
    Custom(String),
}

impl WrapperShape {
    pub fn label(&self) -> &str {
        match self {
            Self::Raven => "raven",
            Self::NewRelic => "newrelic",
            Self::Rollbar => "rollbar",
            Self::Bugsnag => "bugsnag",
            Self::Sentry => "sentry",
            Self::BugsnagLegacy => "bugsnag-legacy",
            Self::Custom(label) => label,
        }
    }
}

/// Structural requirement on the handler's own properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerRequirement {
    None,
    FunctionProperty(String),
    AnyFunctionProperty(Vec<String>),
    TruthyProperty(String),
    All(Vec<MarkerRequirement>),
}

impl MarkerRequirement {
    pub fn function(name: &str) -> Self {
        Self::FunctionProperty(name.to_owned())
    }

    pub fn is_met_by(&self, handler: &HandlerValue) -> bool {
        match self {
            Self::None => true,
            Self::FunctionProperty(name) => handler.function_property(name).is_some(),
            Self::AnyFunctionProperty(names) => names
                .iter()
                .any(|name| handler.function_property(name).is_some()),
            Self::TruthyProperty(name) => handler
                .property(name)
                .is_some_and(|value| value.is_truthy()),
            Self::All(requirements) => requirements
                .iter()
                .all(|requirement| requirement.is_met_by(handler)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WrapperSignature {
    pub shape: WrapperShape,
    pattern: Regex,
    marker: MarkerRequirement,
}

impl WrapperSignature {
    /// Compiles `pattern` in dot-all mode so signatures span multi-line sources.
    pub fn new(shape: WrapperShape, pattern: &str, marker: MarkerRequirement) -> WatchResult<Self> {
        let pattern = RegexBuilder::new(pattern)
            .dot_matches_new_line(true)
            .build()
            .map_err(|error| {
                WatchError::new(
                    "signature.pattern_invalid",
                    format!("invalid signature for {}: {error}", shape.label()),
                )
            })?;

        Ok(Self {
            shape,
            pattern,
            marker,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, handler: &HandlerValue) -> bool {
        self.pattern.is_match(&handler.source) && self.marker.is_met_by(handler)
    }
}

/// Ordered signature list; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct SignatureMatcher {
    signatures: Vec<WrapperSignature>,
}

impl SignatureMatcher {
    pub fn builtin() -> Self {
        let entries = [
            (
                WrapperShape::Raven,
                r"\.deep.*apply.*captureException",
                MarkerRequirement::None,
            ),
            (
                WrapperShape::NewRelic,
                r"arguments.*(start|typeof).*err.*finally.*end",
                MarkerRequirement::function("nr@original"),
            ),
            (
                WrapperShape::Rollbar,
                r"rollbarContext.*rollbarWrappedError",
                MarkerRequirement::All(vec![
                    MarkerRequirement::TruthyProperty("_isWrap".to_owned()),
                    MarkerRequirement::AnyFunctionProperty(vec![
                        "_wrapped".to_owned(),
                        "_rollbar_wrapped".to_owned(),
                    ]),
                ]),
            ),
            (
                WrapperShape::Bugsnag,
                r"autoNotify.*(unhandledException|notifyException)",
                MarkerRequirement::function("bugsnag"),
            ),
            (
                WrapperShape::Sentry,
                r"call.*arguments.*typeof.*apply",
                MarkerRequirement::function("__sentry_original__"),
            ),
            (
                WrapperShape::BugsnagLegacy,
                r"function.*function.*\.apply.*arguments",
                MarkerRequirement::function("__trace__"),
            ),
        ];

        let mut matcher = Self::default();
        for (shape, pattern, marker) in entries {
            match WrapperSignature::new(shape, pattern, marker) {
                Ok(signature) => matcher.push(signature),
                Err(error) => log::error!("builtin wrapper signature rejected: {error}"),
            }
        }
        matcher
    }

    pub fn push(&mut self, signature: WrapperSignature) {
        self.signatures.push(signature);
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn detect(&self, handler: &HandlerValue) -> Option<&WrapperSignature> {
        self.signatures
            .iter()
            .find(|signature| signature.matches(handler))
    }

    pub fn is_wrapper(&self, handler: &HandlerValue) -> bool {
        self.detect(handler).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::MarkerRequirement;
    use super::SignatureMatcher;
    use super::WrapperShape;
    use super::WrapperSignature;
    use crate::handler::HandlerValue;
    use crate::handler::PropertyValue;

    fn plain(source: &str) -> HandlerValue {
        HandlerValue::function(source)
    }

    #[test]
    fn builtin_signatures_all_compile() {
        assert_eq!(SignatureMatcher::builtin().len(), 6);
    }

    #[test]
    fn sentry_requires_marker_property() {
        let matcher = SignatureMatcher::builtin();
        let source = "function(){ fn.call(this, arguments); if (typeof fn) return fn.apply(this) }";
        let without_marker = plain(source);
        assert!(matcher.detect(&without_marker).is_none());

        let with_marker =
            plain(source).with_function_property("__sentry_original__", plain("function(e){}"));
        let detected = matcher.detect(&with_marker).map(|signature| &signature.shape);
        assert_eq!(detected, Some(&WrapperShape::Sentry));
    }

    #[test]
    fn signature_spans_newlines() {
        let matcher = SignatureMatcher::builtin();
        let source = "function(){\n  rollbarContext = 1;\n  throw rollbarWrappedError;\n}";
        let handler = plain(source)
            .with_property("_isWrap", PropertyValue::Boolean(true))
            .with_function_property("_rollbar_wrapped", plain("function(e){}"));
        let detected = matcher.detect(&handler).map(|signature| &signature.shape);
        assert_eq!(detected, Some(&WrapperShape::Rollbar));
    }

    #[test]
    fn rollbar_flag_must_be_truthy() {
        let matcher = SignatureMatcher::builtin();
        let handler = plain("rollbarContext rollbarWrappedError")
            .with_property("_isWrap", PropertyValue::Boolean(false))
            .with_function_property("_wrapped", plain("function(e){}"));
        assert!(!matcher.is_wrapper(&handler));
    }

    #[test]
    fn plain_handler_is_not_a_wrapper() {
        let matcher = SignatureMatcher::builtin();
        assert!(!matcher.is_wrapper(&plain("function(e){ console.log(e.data) }")));
    }

    #[test]
    fn custom_signatures_extend_the_list() {
        let mut matcher = SignatureMatcher::default();
        let signature = WrapperSignature::new(
            WrapperShape::Custom("acme".to_owned()),
            r"acmeGuard",
            MarkerRequirement::function("original"),
        );
        assert!(signature.is_ok());
        matcher.push(signature.unwrap_or_else(|_| unreachable!()));

        let handler = plain("function(){ acmeGuard() }")
            .with_function_property("original", plain("function(e){}"));
        assert!(matcher.is_wrapper(&handler));
        assert_eq!(
            matcher.detect(&handler).map(|signature| signature.shape.label()),
            Some("acme")
        );
    }

    #[test]
    fn invalid_custom_pattern_is_rejected() {
        let signature = WrapperSignature::new(
            WrapperShape::Custom("broken".to_owned()),
            "(unclosed",
            MarkerRequirement::None,
        );
        assert!(signature.is_err());
    }
}
