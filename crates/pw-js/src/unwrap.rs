//! Peels instrumentation wrappers off registered handlers.
//!
//! Each registered shape pairs a [`WrapperSignature`] with an [`UnwrapRule`].
//! Recursion continues while the current handler matches a signature and the
//! rule yields a new inner handler. Every step is failure-safe: a rule that
//! cannot apply halts with whatever was peeled so far.

use crate::handler::HandlerValue;
use crate::signature::SignatureMatcher;
use crate::signature::WrapperShape;
use crate::signature::WrapperSignature;

pub const DEFAULT_MAX_UNWRAP_DEPTH: usize = 8;

const BUGSNAG_CALLER_DEPTH: usize = 3;
const LEGACY_CALLER_DEPTH: usize = 2;

/// Access to the functions that invoked the registration hook.
///
/// Depth 1 is the immediate caller of the hook. Engines without caller
/// introspection return `None` everywhere.
pub trait CallerLookup {
    fn caller(&self, depth: usize) -> Option<HandlerValue>;

    fn caller_argument(&self, depth: usize, index: usize) -> Option<HandlerValue>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCallers;

impl CallerLookup for NoCallers {
    fn caller(&self, _depth: usize) -> Option<HandlerValue> {
        None
    }

    fn caller_argument(&self, _depth: usize, _index: usize) -> Option<HandlerValue> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnwrapRule {
    /// Exactly one function property next to exactly one boolean property.
    SoleFunctionProperty { offset: usize },
    FollowProperty { property: String, offset: usize },
    /// The wrapper adds stack frames but exposes no inner handler.
    SkipFrames { offset: usize },
    /// Reports the caller's source when the caller is not itself a wrapper.
    CallerDisplayName {
        depth: usize,
        offset: usize,
        wrapped_offset: usize,
    },
    /// Replaces the handler with a caller argument when it is not a wrapper.
    CallerArgument {
        depth: usize,
        index: usize,
        offset: usize,
        wrapped_offset: usize,
    },
}

/// Outcome of [`Unwrapper::unwrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub handler: HandlerValue,
    pub offset: usize,
    pub layers: Vec<WrapperShape>,
    pub display_name: Option<String>,
    pub halted: Option<&'static str>,
}

impl Unwrapped {
    /// Text reported as the listener's code.
    pub fn code(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or(self.handler.source.as_str())
    }
}

enum Step {
    Peel {
        next: HandlerValue,
        offset: usize,
    },
    Annotate {
        offset: usize,
        display_name: Option<String>,
    },
    Halt(&'static str),
}

#[derive(Debug, Clone)]
pub struct Unwrapper {
    matcher: SignatureMatcher,
    rules: Vec<(WrapperShape, UnwrapRule)>,
    max_depth: usize,
}

impl Default for Unwrapper {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Unwrapper {
    pub fn builtin() -> Self {
        Self {
            matcher: SignatureMatcher::builtin(),
            rules: vec![
                (
                    WrapperShape::Raven,
                    UnwrapRule::SoleFunctionProperty { offset: 1 },
                ),
                (
                    WrapperShape::NewRelic,
                    UnwrapRule::FollowProperty {
                        property: "nr@original".to_owned(),
                        offset: 1,
                    },
                ),
                (WrapperShape::Rollbar, UnwrapRule::SkipFrames { offset: 2 }),
                (
                    WrapperShape::Bugsnag,
                    UnwrapRule::CallerDisplayName {
                        depth: BUGSNAG_CALLER_DEPTH,
                        offset: 1,
                        wrapped_offset: 1,
                    },
                ),
                (
                    WrapperShape::Sentry,
                    UnwrapRule::FollowProperty {
                        property: "__sentry_original__".to_owned(),
                        offset: 1,
                    },
                ),
                (
                    WrapperShape::BugsnagLegacy,
                    UnwrapRule::CallerArgument {
                        depth: LEGACY_CALLER_DEPTH,
                        index: 0,
                        offset: 1,
                        wrapped_offset: 1,
                    },
                ),
            ],
            max_depth: DEFAULT_MAX_UNWRAP_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Appends a shape after the existing entries.
    pub fn register(&mut self, signature: WrapperSignature, rule: UnwrapRule) {
        self.rules.push((signature.shape.clone(), rule));
        self.matcher.push(signature);
    }

    pub fn matcher(&self) -> &SignatureMatcher {
        &self.matcher
    }

    pub fn unwrap(&self, handler: &HandlerValue, callers: &dyn CallerLookup) -> Unwrapped {
        let mut current = handler.clone();
        let mut offset = 0usize;
        let mut layers = Vec::new();
        let mut display_name = None;
        let mut halted = None;

        for _ in 0..self.max_depth {
            let Some(signature) = self.matcher.detect(&current) else {
                break;
            };
            let Some(rule) = self.rule_for(&signature.shape) else {
                halted = Some("no rule registered");
                break;
            };
            let shape = signature.shape.clone();

            match self.apply(rule, &current, callers) {
                Step::Peel { next, offset: added } => {
                    offset = offset.saturating_add(added);
                    layers.push(shape);
                    current = next;
                }
                Step::Annotate {
                    offset: added,
                    display_name: name,
                } => {
                    offset = offset.saturating_add(added);
                    layers.push(shape);
                    display_name = name;
                    break;
                }
                Step::Halt(reason) => {
                    halted = Some(reason);
                    break;
                }
            }
        }

        if halted.is_none() && layers.len() == self.max_depth && self.matcher.is_wrapper(&current)
        {
            halted = Some("depth cap reached");
        }

        if let Some(bound) = current.bound_name() {
            display_name = Some(bound.to_owned());
        }

        Unwrapped {
            handler: current,
            offset,
            layers,
            display_name,
            halted,
        }
    }

    fn rule_for(&self, shape: &WrapperShape) -> Option<&UnwrapRule> {
        self.rules
            .iter()
            .find(|(candidate, _)| candidate == shape)
            .map(|(_, rule)| rule)
    }

    fn apply(&self, rule: &UnwrapRule, handler: &HandlerValue, callers: &dyn CallerLookup) -> Step {
        match rule {
            UnwrapRule::SoleFunctionProperty { offset } => {
                let mut functions = handler.function_properties();
                let first = functions.next();
                if functions.next().is_some() {
                    return Step::Halt("more than one function property");
                }
                match first {
                    Some(inner) if handler.boolean_property_count() == 1 => Step::Peel {
                        next: inner.clone(),
                        offset: *offset,
                    },
                    _ => Step::Halt("no sole function property"),
                }
            }
            UnwrapRule::FollowProperty { property, offset } => {
                match handler.function_property(property) {
                    Some(inner) => Step::Peel {
                        next: inner.clone(),
                        offset: *offset,
                    },
                    None => Step::Halt("wrapped property missing"),
                }
            }
            UnwrapRule::SkipFrames { offset } => Step::Annotate {
                offset: *offset,
                display_name: None,
            },
            UnwrapRule::CallerDisplayName {
                depth,
                offset,
                wrapped_offset,
            } => match callers.caller(*depth) {
                Some(caller) if !self.matcher.is_wrapper(&caller) => Step::Annotate {
                    offset: *offset,
                    display_name: Some(caller.source),
                },
                Some(_) => Step::Annotate {
                    offset: offset.saturating_add(*wrapped_offset),
                    display_name: None,
                },
                None => Step::Annotate {
                    offset: *offset,
                    display_name: None,
                },
            },
            UnwrapRule::CallerArgument {
                depth,
                index,
                offset,
                wrapped_offset,
            } => match callers.caller_argument(*depth, *index) {
                Some(argument) if !self.matcher.is_wrapper(&argument) => Step::Peel {
                    next: argument,
                    offset: *offset,
                },
                Some(_) => Step::Annotate {
                    offset: offset.saturating_add(*wrapped_offset),
                    display_name: None,
                },
                None => Step::Annotate {
                    offset: *offset,
                    display_name: None,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::CallerLookup;
    use super::NoCallers;
    use super::UnwrapRule;
    use super::Unwrapper;
    use crate::handler::HandlerValue;
    use crate::handler::PropertyValue;
    use crate::signature::MarkerRequirement;
    use crate::signature::WrapperShape;
    use crate::signature::WrapperSignature;

    const ORIGINAL: &str = "function onMessage(e){ handle(e.data) }";
    const SENTRY_SOURCE: &str =
        "function(){ fn.call(this, arguments); if (typeof fn) return fn.apply(this) }";

    struct FixedCallers {
        caller: Option<HandlerValue>,
        argument: Option<HandlerValue>,
    }

    impl CallerLookup for FixedCallers {
        fn caller(&self, _depth: usize) -> Option<HandlerValue> {
            self.caller.clone()
        }

        fn caller_argument(&self, _depth: usize, _index: usize) -> Option<HandlerValue> {
            self.argument.clone()
        }
    }

    fn sentry(inner: HandlerValue) -> HandlerValue {
        HandlerValue::function(SENTRY_SOURCE).with_function_property("__sentry_original__", inner)
    }

    #[test]
    fn plain_handler_passes_through() {
        let unwrapper = Unwrapper::builtin();
        let result = unwrapper.unwrap(&HandlerValue::function(ORIGINAL), &NoCallers);
        assert_eq!(result.offset, 0);
        assert!(result.layers.is_empty());
        assert_eq!(result.code(), ORIGINAL);
    }

    #[test]
    fn peels_nested_sentry_and_newrelic_layers() {
        let newrelic = HandlerValue::function(
            "function(){ var a = arguments; start(); try {} catch (err) {} finally { end() } }",
        )
        .with_function_property("nr@original", HandlerValue::function(ORIGINAL));
        let wrapped = sentry(newrelic);

        let result = Unwrapper::builtin().unwrap(&wrapped, &NoCallers);
        assert_eq!(result.code(), ORIGINAL);
        assert_eq!(result.offset, 2);
        assert_eq!(
            result.layers,
            vec![WrapperShape::Sentry, WrapperShape::NewRelic]
        );
        assert_eq!(result.halted, None);
    }

    #[test]
    fn raven_ambiguity_halts_recursion() {
        let raven = HandlerValue::function("function(){ x.deep(); fn.apply(this); captureException() }")
            .with_function_property("a", HandlerValue::function(ORIGINAL))
            .with_function_property("b", HandlerValue::function("function(){}"))
            .with_property("c", PropertyValue::Boolean(true));

        let result = Unwrapper::builtin().unwrap(&raven, &NoCallers);
        assert_eq!(result.offset, 0);
        assert!(result.layers.is_empty());
        assert_eq!(result.halted, Some("more than one function property"));
        assert_eq!(result.handler, raven);
    }

    #[test]
    fn raven_sole_function_is_followed() {
        let raven = HandlerValue::function("function(){ x.deep(); fn.apply(this); captureException() }")
            .with_function_property("a", HandlerValue::function(ORIGINAL))
            .with_property("c", PropertyValue::Boolean(false));

        let result = Unwrapper::builtin().unwrap(&raven, &NoCallers);
        assert_eq!(result.code(), ORIGINAL);
        assert_eq!(result.offset, 1);
    }

    #[test]
    fn rollbar_adds_offset_without_unwrapping() {
        let rollbar = HandlerValue::function("function(){ rollbarContext; rollbarWrappedError }")
            .with_property("_isWrap", PropertyValue::Boolean(true))
            .with_function_property("_wrapped", HandlerValue::function(ORIGINAL));

        let result = Unwrapper::builtin().unwrap(&rollbar, &NoCallers);
        assert_eq!(result.offset, 2);
        assert_eq!(result.layers, vec![WrapperShape::Rollbar]);
        assert_eq!(result.handler, rollbar);
    }

    #[test]
    fn bugsnag_reports_plain_caller_as_display_name() {
        let bugsnag = HandlerValue::function("function(){ autoNotify(); notifyException() }")
            .with_function_property("bugsnag", HandlerValue::function("function(){}"));
        let callers = FixedCallers {
            caller: Some(HandlerValue::function("function setup(){ listen() }")),
            argument: None,
        };

        let result = Unwrapper::builtin().unwrap(&bugsnag, &callers);
        assert_eq!(result.offset, 1);
        assert_eq!(result.code(), "function setup(){ listen() }");

        let wrapped_caller = FixedCallers {
            caller: Some(sentry(HandlerValue::function(ORIGINAL))),
            argument: None,
        };
        let result = Unwrapper::builtin().unwrap(&bugsnag, &wrapped_caller);
        assert_eq!(result.offset, 2);
        assert_eq!(result.display_name, None);
    }

    #[test]
    fn legacy_bugsnag_replaces_handler_with_caller_argument() {
        let legacy = HandlerValue::function("function(){ return function(){ fn.apply(this, arguments) } }")
            .with_function_property("__trace__", HandlerValue::function("function(){}"));
        let callers = FixedCallers {
            caller: None,
            argument: Some(HandlerValue::function(ORIGINAL)),
        };

        let result = Unwrapper::builtin().unwrap(&legacy, &callers);
        assert_eq!(result.code(), ORIGINAL);
        assert_eq!(result.offset, 1);

        let result = Unwrapper::builtin().unwrap(&legacy, &NoCallers);
        assert_eq!(result.offset, 1);
        assert_eq!(result.handler, legacy);
    }

    #[test]
    fn depth_cap_stops_self_similar_chains() {
        let mut handler = HandlerValue::function(ORIGINAL);
        for _ in 0..12 {
            handler = sentry(handler);
        }

        let result = Unwrapper::builtin().with_max_depth(8).unwrap(&handler, &NoCallers);
        assert_eq!(result.layers.len(), 8);
        assert_eq!(result.halted, Some("depth cap reached"));
    }

    #[test]
    fn bound_names_override_code() {
        let bound = HandlerValue::function("function () { [native code] }").named("bound receive");
        let result = Unwrapper::builtin().unwrap(&sentry(bound), &NoCallers);
        assert_eq!(result.code(), "bound receive");
    }

    #[test]
    fn registered_shapes_apply_after_builtins() {
        let mut unwrapper = Unwrapper::builtin();
        let signature = WrapperSignature::new(
            WrapperShape::Custom("acme".to_owned()),
            "acmeGuard",
            MarkerRequirement::function("original"),
        )
        .unwrap_or_else(|_| unreachable!());
        unwrapper.register(
            signature,
            UnwrapRule::FollowProperty {
                property: "original".to_owned(),
                offset: 3,
            },
        );

        let handler = HandlerValue::function("function(){ acmeGuard() }")
            .with_function_property("original", HandlerValue::function(ORIGINAL));
        let result = unwrapper.unwrap(&handler, &NoCallers);
        assert_eq!(result.code(), ORIGINAL);
        assert_eq!(result.offset, 3);
    }
}
