//! Registration hooks and the enrichment pipeline behind them.
//!
//! [`RegistrationBroker`] is the hosting surface: it keeps the original
//! listener table and calls the installed [`ListenerHook`] before forwarding.
//! [`MessageInterceptor`] is the hook that turns a registration into a
//! [`ListenerRecord`] and emits it over the bridge.

use crate::callsite::CallSite;
use crate::callsite::CallSiteLocator;
use crate::callsite::CapturedStack;
use crate::callsite::StackSource;
use crate::callsite::jquery_marker;
use crate::handler::HandlerValue;
use crate::hops::FrameId;
use crate::hops::FrameTree;
use crate::unwrap::CallerLookup;
use crate::unwrap::Unwrapper;
use pw_core::ListenerRecord;
use pw_core::UNKNOWN;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_ipc::InboundMessage;
use pw_ipc::ObservationSink;
use regex::Regex;
use std::cell::Cell;

pub const MESSAGE_EVENT: &str = "message";

/// Source fragment identifying jQuery's shared event dispatcher.
pub const JQUERY_DISPATCHER_FRAGMENT: &str = "event.dispatch.apply";

/// Stack line reported for handlers found in jQuery's event data.
pub const JQUERY_STACK_LINE: &str = "jQuery";

/// Browser extensions and devtools that register message listeners on
/// every page.
const EXTENSION_DENYLIST: &[&str] = &[
    "chrome-extension://",
    "moz-extension://",
    "safari-extension://",
    "safari-web-extension://",
    "__REACT_DEVTOOLS_GLOBAL_HOOK__",
    "__VUE_DEVTOOLS_GLOBAL_HOOK__",
    "__REDUX_DEVTOOLS_EXTENSION__",
    "__MOBX_DEVTOOLS_GLOBAL_HOOK__",
];

/// Registrations that are passed through without being reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptPolicy {
    pub skip_extension_listeners: bool,
    pub extra_denylist: Vec<String>,
}

impl Default for InterceptPolicy {
    fn default() -> Self {
        Self {
            skip_extension_listeners: true,
            extra_denylist: Vec::new(),
        }
    }
}

impl InterceptPolicy {
    pub fn should_skip(&self, handler: &HandlerValue, stack: Option<&str>) -> bool {
        let builtin: &[&str] = if self.skip_extension_listeners {
            EXTENSION_DENYLIST
        } else {
            &[]
        };
        let extra = self.extra_denylist.iter().map(String::as_str);

        builtin.iter().copied().chain(extra).any(|fragment| {
            !fragment.is_empty()
                && (handler.source.contains(fragment)
                    || stack.is_some_and(|stack| stack.contains(fragment)))
        })
    }
}

/// Where the observed page lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub page_url: String,
    pub frames: FrameTree,
}

impl PageContext {
    pub fn new(page_url: impl Into<String>) -> Self {
        let page_url = page_url.into();
        let origin = url::Url::parse(&page_url)
            .map(|parsed| parsed.origin().ascii_serialization())
            .unwrap_or_default();
        Self {
            page_url,
            frames: FrameTree::new(origin),
        }
    }

    pub fn with_frames(mut self, frames: FrameTree) -> Self {
        self.frames = frames;
        self
    }

    pub fn domain(&self) -> String {
        url::Url::parse(&self.page_url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_owned))
            .unwrap_or_else(|| UNKNOWN.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPath {
    AddEventListener,
    OnMessageSetter,
    JQueryData,
}

/// One hooked registration as seen from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub handler: HandlerValue,
    pub stack: CapturedStack,
    pub path: RegistrationPath,
    /// Registering frame; `None` means the current frame.
    pub frame: Option<FrameId>,
}

impl Registration {
    pub fn new(handler: HandlerValue, stack: Option<String>, path: RegistrationPath) -> Self {
        Self {
            handler,
            stack: CapturedStack(stack),
            path,
            frame: None,
        }
    }

    pub fn in_frame(mut self, frame: FrameId) -> Self {
        self.frame = Some(frame);
        self
    }
}

/// Callback surface installed into a [`RegistrationBroker`].
pub trait ListenerHook {
    fn on_listener(&self, registration: &Registration, callers: &dyn CallerLookup);

    fn on_history_push(&self, url: &str);

    fn on_page_change(&self);
}

pub struct MessageInterceptor<S> {
    sink: S,
    context: PageContext,
    unwrapper: Unwrapper,
    locator: CallSiteLocator,
    policy: InterceptPolicy,
    jquery_marker: Option<Regex>,
    jquery_dispatcher_seen: Cell<bool>,
    diagnostics: bool,
}

impl<S: ObservationSink> MessageInterceptor<S> {
    pub fn new(sink: S, context: PageContext) -> Self {
        Self {
            sink,
            context,
            unwrapper: Unwrapper::builtin(),
            locator: CallSiteLocator::default(),
            policy: InterceptPolicy::default(),
            jquery_marker: jquery_marker(),
            jquery_dispatcher_seen: Cell::new(false),
            diagnostics: true,
        }
    }

    pub fn with_unwrapper(mut self, unwrapper: Unwrapper) -> Self {
        self.unwrapper = unwrapper;
        self
    }

    pub fn with_locator(mut self, locator: CallSiteLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_policy(mut self, policy: InterceptPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn without_diagnostics(mut self) -> Self {
        self.diagnostics = false;
        self
    }

    pub fn context(&self) -> &PageContext {
        &self.context
    }

    pub fn jquery_dispatcher_seen(&self) -> bool {
        self.jquery_dispatcher_seen.get()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Enriches and emits one registration.
    ///
    /// Returns the emitted record, or `None` when the registration was
    /// passed through unobserved.
    pub fn observe(
        &self,
        registration: &Registration,
        callers: &dyn CallerLookup,
    ) -> Option<ListenerRecord> {
        let handler = &registration.handler;
        if handler.is_internal() {
            return None;
        }

        let stack_text = registration.stack.capture();
        if self.policy.should_skip(handler, stack_text.as_deref()) {
            log::debug!("skipping denylisted message listener");
            return None;
        }

        let unwrapped = self.unwrapper.unwrap(handler, callers);
        for layer in &unwrapped.layers {
            self.diagnostic(format!("unwrapped {} wrapper", layer.label()));
        }
        if let Some(reason) = unwrapped.halted {
            self.diagnostic(format!("unwrap stopped: {reason}"));
        }
        if let Some(name) = &unwrapped.display_name {
            self.diagnostic(format!("reporting listener as `{name}`"));
        }

        let dispatcher = unwrapped
            .handler
            .source
            .contains(JQUERY_DISPATCHER_FRAGMENT);
        if dispatcher {
            self.jquery_dispatcher_seen.set(true);
            self.diagnostic("found jQuery dispatcher");
        }

        let site = match registration.path {
            RegistrationPath::JQueryData => CallSite {
                line: JQUERY_STACK_LINE.to_owned(),
                full: Vec::new(),
            },
            _ => {
                let marker = if dispatcher {
                    self.jquery_marker.as_ref()
                } else {
                    None
                };
                self.locator
                    .locate(&registration.stack, unwrapped.offset, marker)
            }
        };

        let code = unwrapped.code();
        let frames = &self.context.frames;
        let frame = registration.frame.unwrap_or_else(|| frames.current());
        let record = ListenerRecord {
            window_label: frames.window_label(frame),
            frame_path: frames.resolve(Some(frame)),
            domain: self.context.domain(),
            source_stack_line: site.line,
            full_stack_lines: site.full,
            code: if code.is_empty() {
                UNKNOWN.to_owned()
            } else {
                code.to_owned()
            },
            parent_url: String::new(),
        };

        self.sink.emit(InboundMessage::from_record(&record));
        Some(record)
    }

    pub fn history_pushed(&self) {
        self.sink.emit(InboundMessage::push_state());
    }

    pub fn page_changed(&self) {
        self.sink.emit(InboundMessage::change_page());
    }

    pub fn forward_page_log(&self, line: impl Into<String>) {
        self.diagnostic(line);
    }

    fn diagnostic(&self, line: impl Into<String>) {
        if self.diagnostics {
            self.sink.emit(InboundMessage::log(line));
        }
    }
}

impl<S: ObservationSink> ListenerHook for MessageInterceptor<S> {
    fn on_listener(&self, registration: &Registration, callers: &dyn CallerLookup) {
        self.observe(registration, callers);
    }

    fn on_history_push(&self, _url: &str) {
        self.history_pushed();
    }

    fn on_page_change(&self) {
        self.page_changed();
    }
}

/// Original registration surface of one execution context, with at most one
/// hook in front of it.
pub struct RegistrationBroker<'a> {
    hook: Option<Box<dyn ListenerHook + 'a>>,
    listeners: Vec<(String, HandlerValue)>,
    onmessage: Option<HandlerValue>,
    history: Vec<String>,
}

impl Default for RegistrationBroker<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> RegistrationBroker<'a> {
    pub fn new() -> Self {
        Self {
            hook: None,
            listeners: Vec::new(),
            onmessage: None,
            history: Vec::new(),
        }
    }

    pub fn install(&mut self, hook: impl ListenerHook + 'a) -> WatchResult<()> {
        if self.hook.is_some() {
            return Err(WatchError::new(
                "intercept.already_installed",
                "a listener hook is already installed in this context",
            ));
        }
        self.hook = Some(Box::new(hook));
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.hook.is_some()
    }

    pub fn add_event_listener(
        &mut self,
        event_type: &str,
        handler: HandlerValue,
        stack: Option<String>,
        callers: &dyn CallerLookup,
    ) {
        if let Some(hook) = self.hook.as_ref().filter(|_| event_type == MESSAGE_EVENT) {
            let registration =
                Registration::new(handler.clone(), stack, RegistrationPath::AddEventListener);
            hook.on_listener(&registration, callers);
        }
        self.listeners.push((event_type.to_owned(), handler));
    }

    pub fn remove_event_listener(&mut self, event_type: &str, handler: &HandlerValue) {
        if let Some(index) = self
            .listeners
            .iter()
            .position(|(kind, existing)| kind == event_type && existing == handler)
        {
            self.listeners.remove(index);
        }
    }

    pub fn set_onmessage(
        &mut self,
        handler: Option<HandlerValue>,
        stack: Option<String>,
        callers: &dyn CallerLookup,
    ) {
        if let (Some(hook), Some(handler)) = (&self.hook, &handler) {
            let registration =
                Registration::new(handler.clone(), stack, RegistrationPath::OnMessageSetter);
            hook.on_listener(&registration, callers);
        }
        self.onmessage = handler;
    }

    pub fn onmessage(&self) -> Option<&HandlerValue> {
        self.onmessage.as_ref()
    }

    pub fn push_state(&mut self, url: &str) {
        if let Some(hook) = &self.hook {
            hook.on_history_push(url);
        }
        self.history.push(url.to_owned());
    }

    pub fn navigate_away(&mut self) {
        if let Some(hook) = &self.hook {
            hook.on_page_change();
        }
    }

    pub fn listeners<'b>(&'b self, event_type: &'b str) -> impl Iterator<Item = &'b HandlerValue> {
        self.listeners
            .iter()
            .filter(move |(kind, _)| kind == event_type)
            .map(|(_, handler)| handler)
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }
}
