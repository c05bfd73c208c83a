//! Boa-hosted page runtime with the message registration points hooked.
//!
//! Hooks run inside the engine and only queue plain descriptions of what
//! they saw. The host drains that queue after every script and timer flush
//! and feeds it through the [`MessageInterceptor`].
//!
//! Handler source text comes from the [`SourceIndex`] built while loading
//! each script. Call sites come from the engine's own call frames, read by
//! the native `__pw_frames` global.

use crate::handler::HandlerProperty;
use crate::handler::HandlerValue;
use crate::handler::PropertyValue;
use crate::intercept::MessageInterceptor;
use crate::intercept::PageContext;
use crate::intercept::Registration;
use crate::intercept::RegistrationPath;
use crate::source_map::SourceIndex;
use crate::unwrap::DEFAULT_MAX_UNWRAP_DEPTH;
use crate::unwrap::NoCallers;
use crate::unwrap::Unwrapper;
use boa_engine::Context;
use boa_engine::JsResult;
use boa_engine::JsValue;
use boa_engine::NativeFunction;
use boa_engine::Script;
use boa_engine::Source;
use boa_engine::js_string;
use boa_engine::object::builtins::JsArray;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_ipc::ObservationSink;
use serde::Deserialize;

const BOOTSTRAP_ENV: &str = r#"
globalThis.window = globalThis;
globalThis.self = globalThis;
globalThis.top = globalThis;
globalThis.parent = globalThis;
globalThis.navigator = {
  userAgent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
  language: "en-US",
  languages: ["en-US", "en"],
  platform: "Linux x86_64"
};
globalThis.console = {
  log: function () {},
  info: function () {},
  warn: function () {},
  error: function () {},
  debug: function () {}
};
globalThis.performance = {
  now: function () { return Date.now(); },
  timeOrigin: 0
};
globalThis.__pw_timer_queue = [];
globalThis.__pw_timer_cancelled = {};
globalThis.__pw_next_timer_id = 1;
globalThis.setTimeout = function (callback, _delay) {
  var cb = callback;
  if (typeof cb !== "function") {
    var src = String(callback);
    cb = function () { (0, eval)(src); };
  }
  var id = globalThis.__pw_next_timer_id++;
  globalThis.__pw_timer_queue.push({ id: id, cb: cb });
  return id;
};
globalThis.clearTimeout = function (id) {
  globalThis.__pw_timer_cancelled[String(id)] = true;
};
globalThis.setInterval = function (callback, delay) {
  return globalThis.setTimeout(callback, delay);
};
globalThis.clearInterval = globalThis.clearTimeout;
globalThis.queueMicrotask = function (callback) {
  return globalThis.setTimeout(callback, 0);
};
globalThis.__pw_flush_timers = function (limit) {
  var maxRuns = Number(limit) || 0;
  if (maxRuns < 1) {
    maxRuns = 1;
  }
  var runs = 0;
  while (globalThis.__pw_timer_queue.length > 0 && runs < maxRuns) {
    var task = globalThis.__pw_timer_queue.shift();
    if (!task) {
      continue;
    }
    var cancelled = !!globalThis.__pw_timer_cancelled[String(task.id)];
    delete globalThis.__pw_timer_cancelled[String(task.id)];
    if (!cancelled) {
      try { task.cb(); } catch (e) {}
    }
    runs++;
  }
  return runs;
};
"#;

/// Frames the hook itself adds below the registering caller.
const HOOK_FRAMES: usize = 2;
const HOOK_LOCATION: &str = "portwatch:hook";
/// Engine name of a script's top-level code.
const MAIN_FRAME: &str = "<main>";

const INSTRUMENTATION: &str = r#"
(function () {
  if (globalThis.__pw_installed === true) {
    return;
  }
  Object.defineProperty(globalThis, "__pw_installed", { value: true });

  var queue = [];
  var tags = new WeakMap();
  var listeners = Object.create(null);
  var onmessageSlot = null;
  var MAX_DEPTH = 3;
  var MAX_PROPS = 32;

  function record(event) {
    try { queue.push(event); } catch (e) {}
  }

  Object.defineProperty(globalThis, "__pw_tag", {
    value: function (id, fn, inferred) {
      try {
        if (typeof fn === "function" && !tags.has(fn)) {
          tags.set(fn, id);
          if (typeof inferred === "string" && fn.name === "") {
            Object.defineProperty(fn, "name", { value: inferred, configurable: true });
          }
        }
      } catch (e) {}
      return fn;
    }
  });

  function describe(fn, depth) {
    var out = { source: "", name: "", span: null, props: [] };
    try { out.source = String(Function.prototype.toString.call(fn)); } catch (e) {}
    try { out.name = typeof fn.name === "string" ? fn.name : ""; } catch (e) {}
    try { out.span = tags.has(fn) ? tags.get(fn) : null; } catch (e) {}
    if (depth >= MAX_DEPTH) {
      return out;
    }
    var keys = [];
    try { keys = Object.keys(fn); } catch (e) {}
    for (var i = 0; i < keys.length && i < MAX_PROPS; i++) {
      var key = keys[i];
      var value;
      try { value = fn[key]; } catch (e) { continue; }
      if (typeof value === "function") {
        out.props.push({ name: key, kind: "function", value: describe(value, depth + 1) });
      } else if (typeof value === "boolean") {
        out.props.push({ name: key, kind: "boolean", flag: value });
      } else {
        out.props.push({ name: key, kind: "other" });
      }
    }
    return out;
  }

  function observe(handler, via) {
    var frames = [];
    try { frames = __pw_frames(); } catch (e) {}
    try {
      record({ kind: "listener", via: via, handler: describe(handler, 0), frames: frames });
    } catch (e) {}
  }

  function dispatch(event) {
    var type = String(event && event.type);
    var registered = listeners[type] ? listeners[type].slice() : [];
    for (var i = 0; i < registered.length; i++) {
      try { registered[i].call(globalThis, event); } catch (e) {}
    }
    if (type === "message" && typeof onmessageSlot === "function") {
      try { onmessageSlot.call(globalThis, event); } catch (e) {}
    }
    return true;
  }

  globalThis.addEventListener = function (type, handler) {
    if (String(type) === "message" && typeof handler === "function") {
      observe(handler, "add_event_listener");
    }
    if (typeof handler !== "function") {
      return;
    }
    var key = String(type);
    if (!listeners[key]) {
      listeners[key] = [];
    }
    listeners[key].push(handler);
  };
  globalThis.removeEventListener = function (type, handler) {
    var registered = listeners[String(type)];
    if (!registered) {
      return;
    }
    var index = registered.indexOf(handler);
    if (index >= 0) {
      registered.splice(index, 1);
    }
  };
  globalThis.dispatchEvent = dispatch;

  Object.defineProperty(globalThis, "onmessage", {
    configurable: true,
    enumerable: true,
    get: function () { return onmessageSlot; },
    set: function (handler) {
      if (typeof handler === "function") {
        observe(handler, "onmessage");
      }
      onmessageSlot = handler;
    }
  });

  globalThis.history = {
    length: 1,
    state: null,
    pushState: function (state, _title, url) {
      record({ kind: "push_state", url: url == null ? "" : String(url) });
      this.state = state;
      this.length += 1;
    },
    replaceState: function (state) { this.state = state; },
    back: function () {},
    forward: function () {},
    go: function () {}
  };

  globalThis.postMessage = function (data) {
    var event = {
      type: "message",
      data: data,
      origin: globalThis.location ? String(globalThis.location.origin || "") : "",
      source: globalThis
    };
    globalThis.setTimeout(function () { dispatch(event); }, 0);
  };

  function sweepEvents(events) {
    if (!events || !events.message || !events.message.length) {
      return;
    }
    for (var j = 0; j < events.message.length; j++) {
      var entry = events.message[j];
      if (entry && typeof entry.handler === "function") {
        record({ kind: "listener", via: "jquery", handler: describe(entry.handler, 0), frames: [] });
      }
    }
  }

  globalThis.__pw_record = record;
  globalThis.__pw_drain = function () {
    var out = queue;
    queue = [];
    return JSON.stringify(out);
  };
  globalThis.__pw_jquery_sweep = function () {
    var names = [];
    try { names = Object.getOwnPropertyNames(globalThis); } catch (e) { return; }
    for (var i = 0; i < names.length; i++) {
      var key = names[i];
      if (key.indexOf("jQuery") === -1) {
        continue;
      }
      try {
        var candidate = globalThis[key];
        if (typeof candidate === "function" && typeof candidate._data === "function") {
          record({ kind: "log", message: "found jQuery handler store on " + key });
          sweepEvents(candidate._data(globalThis, "events"));
        } else if (candidate && candidate.expando) {
          var n = 1;
          var instance;
          while ((instance = globalThis[candidate.expando + n++])) {
            sweepEvents(instance.events);
          }
        } else if (candidate) {
          sweepEvents(candidate.events);
        }
      } catch (e) {}
    }
  };
})();
"#;

const HOST_BOOTSTRAP: &str = r#"
(function () {
  var host = globalThis.__pw_host || {};
  var href = String(host.href || "");
  function leave(next) {
    try { globalThis.__pw_record({ kind: "change_page" }); } catch (e) {}
    href = String(next == null ? "" : next);
  }
  var location = {
    origin: String(host.origin || ""),
    hostname: String(host.domain || ""),
    assign: function (next) { leave(next); },
    replace: function (next) { leave(next); },
    reload: function () { leave(href); },
    toString: function () { return href; }
  };
  Object.defineProperty(location, "href", {
    enumerable: true,
    get: function () { return href; },
    set: function (next) { leave(next); }
  });
  globalThis.location = location;
  globalThis.name = String(host.name || "");
  globalThis.document = {
    domain: String(host.domain || ""),
    URL: href,
    readyState: "complete",
    title: "",
    cookie: "",
    location: location,
    addEventListener: function () {},
    removeEventListener: function () {},
    getElementById: function () { return null; },
    querySelector: function () { return null; },
    querySelectorAll: function () { return []; },
    createElement: function (tag) {
      return {
        tagName: String(tag || "").toUpperCase(),
        style: {},
        setAttribute: function () {},
        appendChild: function () {}
      };
    }
  };
})();
"#;

/// Script payload to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    pub origin: String,
    pub source: String,
}

impl ScriptSource {
    pub fn inline(index: usize, source: impl Into<String>) -> Self {
        Self {
            origin: format!("inline:{index}"),
            source: source.into(),
        }
    }
}

/// Runtime hardening knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsRuntimeConfig {
    /// Soft limit: when exceeded, execution continues but a runtime warning is recorded.
    pub max_scripts: usize,
    /// Preferred script-size budget in bytes.
    pub max_script_bytes: usize,
    pub max_error_messages: usize,
    pub max_timer_runs: usize,
    pub recursion_limit: usize,
    pub stack_size_limit: usize,
    pub loop_iteration_limit: u64,
    pub max_unwrap_depth: usize,
}

impl Default for JsRuntimeConfig {
    fn default() -> Self {
        Self {
            max_scripts: 128,
            max_script_bytes: 2 * 1024 * 1024,
            max_error_messages: 24,
            max_timer_runs: 128,
            recursion_limit: 64,
            stack_size_limit: 1024,
            loop_iteration_limit: 100_000,
            max_unwrap_depth: DEFAULT_MAX_UNWRAP_DEPTH,
        }
    }
}

/// Per-script execution error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    pub origin: String,
    pub message: String,
}

/// Runtime outcome summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsExecutionReport {
    pub scripts_seen: usize,
    pub scripts_executed: usize,
    pub scripts_failed: usize,
    pub scripts_skipped: usize,
    pub listeners_reported: usize,
    pub history_pushes: usize,
    pub page_changes: usize,
    pub errors: Vec<ScriptError>,
}

impl JsExecutionReport {
    fn push_error(&mut self, limit: usize, origin: &str, message: String) {
        if self.errors.len() < limit {
            self.errors.push(ScriptError {
                origin: origin.to_owned(),
                message,
            });
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawEvent {
    Listener {
        via: RawPath,
        handler: RawHandler,
        #[serde(default)]
        frames: Vec<String>,
    },
    PushState {
        #[serde(default)]
        url: String,
    },
    ChangePage,
    Log {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawPath {
    AddEventListener,
    Onmessage,
    Jquery,
}

impl From<RawPath> for RegistrationPath {
    fn from(value: RawPath) -> Self {
        match value {
            RawPath::AddEventListener => Self::AddEventListener,
            RawPath::Onmessage => Self::OnMessageSetter,
            RawPath::Jquery => Self::JQueryData,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawHandler {
    #[serde(default)]
    source: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    span: Option<usize>,
    #[serde(default)]
    props: Vec<RawProperty>,
}

#[derive(Debug, Deserialize)]
struct RawProperty {
    name: String,
    kind: String,
    #[serde(default)]
    value: Option<Box<RawHandler>>,
    #[serde(default)]
    flag: Option<bool>,
}

impl RawHandler {
    /// Swaps the engine's placeholder text for the indexed source when the
    /// handler can be traced back to a script.
    fn into_handler(self, sources: &SourceIndex) -> HandlerValue {
        let properties = self
            .props
            .into_iter()
            .map(|property| {
                let value = match (property.kind.as_str(), property.value, property.flag) {
                    ("function", Some(inner), _) => {
                        PropertyValue::Function(Box::new(inner.into_handler(sources)))
                    }
                    ("boolean", _, Some(flag)) => PropertyValue::Boolean(flag),
                    _ => PropertyValue::Other,
                };
                HandlerProperty {
                    name: property.name,
                    value,
                }
            })
            .collect();

        let source = sources
            .resolve(self.span, &self.name)
            .map_or(self.source, str::to_owned);

        HandlerValue {
            source,
            name: self.name,
            properties,
        }
    }
}

/// Script engine facade.
#[derive(Debug, Clone, Default)]
pub struct InstrumentedRuntime {
    config: JsRuntimeConfig,
}

impl InstrumentedRuntime {
    pub fn new(config: JsRuntimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsRuntimeConfig {
        &self.config
    }

    /// Runs `scripts` in a fresh context, reporting every hooked
    /// registration to `sink`. The jQuery sweep runs once all scripts have
    /// loaded.
    pub fn execute<S: ObservationSink>(
        &self,
        page: &PageContext,
        scripts: &[ScriptSource],
        sink: S,
    ) -> JsExecutionReport {
        let mut report = JsExecutionReport {
            scripts_seen: scripts.len(),
            ..JsExecutionReport::default()
        };
        if scripts.is_empty() {
            return report;
        }

        let interceptor = MessageInterceptor::new(sink, page.clone())
            .with_unwrapper(Unwrapper::builtin().with_max_depth(self.config.max_unwrap_depth));

        let mut context = Context::default();
        context
            .runtime_limits_mut()
            .set_recursion_limit(self.config.recursion_limit);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(self.config.stack_size_limit);
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(self.config.loop_iteration_limit);

        if let Err(error) = context.register_global_callable(
            js_string!("__pw_frames"),
            0,
            NativeFunction::from_fn_ptr(call_frames),
        ) {
            report.scripts_failed = report.scripts_failed.saturating_add(1);
            report.push_error(self.config.max_error_messages, "instrumentation", error.to_string());
            report.scripts_skipped = scripts.len();
            return report;
        }

        let host_values = build_host_values(page);
        for (origin, source) in [
            ("bootstrap", BOOTSTRAP_ENV),
            ("instrumentation", INSTRUMENTATION),
            ("host-values", host_values.as_str()),
            ("host-bootstrap", HOST_BOOTSTRAP),
        ] {
            if let Err(error) = context.eval(Source::from_bytes(source.as_bytes())) {
                report.scripts_failed = report.scripts_failed.saturating_add(1);
                report.push_error(self.config.max_error_messages, origin, error.to_string());
                report.scripts_skipped = scripts.len();
                return report;
            }
        }

        if scripts.len() > self.config.max_scripts {
            report.push_error(
                self.config.max_error_messages,
                "runtime",
                format!(
                    "script count {} exceeded soft limit {}; continuing",
                    scripts.len(),
                    self.config.max_scripts
                ),
            );
        }

        let hard_cap = hard_script_byte_cap(self.config.max_script_bytes);
        let mut sources = SourceIndex::new();
        let mut current_origin = "";
        for script in scripts {
            let source_bytes = script.source.as_bytes();
            let source_len = source_bytes.len();
            if source_len > hard_cap {
                report.scripts_skipped = report.scripts_skipped.saturating_add(1);
                continue;
            }
            current_origin = &script.origin;

            let tagged = sources.add_script(&script.origin, &script.source);
            let parsed = match Script::parse(Source::from_bytes(tagged.as_bytes()), None, &mut context) {
                Err(error) if tagged != script.source => {
                    log::debug!("running `{}` untagged: {error}", script.origin);
                    Script::parse(Source::from_bytes(source_bytes), None, &mut context)
                }
                parsed => parsed,
            };

            match parsed.and_then(|parsed| parsed.evaluate(&mut context)) {
                Ok(_) => {
                    report.scripts_executed = report.scripts_executed.saturating_add(1);
                }
                Err(error) => {
                    report.scripts_failed = report.scripts_failed.saturating_add(1);
                    let message = if source_len > self.config.max_script_bytes {
                        format!(
                            "oversized script ({} bytes, preferred <= {}) failed: {error}",
                            source_len, self.config.max_script_bytes
                        )
                    } else {
                        error.to_string()
                    };
                    report.push_error(self.config.max_error_messages, &script.origin, message);
                }
            }
            let loaded = LoadedScripts {
                sources: &sources,
                current_origin,
            };
            self.settle(&mut context, &interceptor, &loaded, &mut report);
        }

        if let Err(error) = context.eval(Source::from_bytes(b"globalThis.__pw_jquery_sweep();")) {
            log::debug!("jQuery sweep failed: {error}");
        }
        let loaded = LoadedScripts {
            sources: &sources,
            current_origin,
        };
        self.settle(&mut context, &interceptor, &loaded, &mut report);

        report
    }

    fn settle<S: ObservationSink>(
        &self,
        context: &mut Context,
        interceptor: &MessageInterceptor<S>,
        loaded: &LoadedScripts<'_>,
        report: &mut JsExecutionReport,
    ) {
        let flush = format!("__pw_flush_timers({});", self.config.max_timer_runs);
        if let Err(error) = context.eval(Source::from_bytes(flush.as_bytes())) {
            log::debug!("timer flush failed: {error}");
        }

        match drain_events(context) {
            Ok(events) => dispatch_events(interceptor, loaded, events, report),
            Err(error) => {
                log::warn!("dropping queued page events: {error}");
                report.push_error(self.config.max_error_messages, "instrumentation", error.to_string());
            }
        }
    }
}

/// Scripts seen so far and the one whose turn produced the queued events.
struct LoadedScripts<'a> {
    sources: &'a SourceIndex,
    current_origin: &'a str,
}

impl LoadedScripts<'_> {
    /// Renders engine frame names, innermost first, as stack text whose
    /// line [`crate::callsite::DEFAULT_BASE_OFFSET`] is the registering
    /// caller.
    fn stack_text(&self, frames: &[String]) -> String {
        if frames.is_empty() {
            return String::new();
        }

        let mut lines = Vec::with_capacity(frames.len() + 1);
        lines.push("Error".to_owned());
        for (depth, name) in frames.iter().enumerate() {
            let label = if name.is_empty() { "<anonymous>" } else { name };
            let line = if depth < HOOK_FRAMES {
                format!("    at {label} ({HOOK_LOCATION})")
            } else if name == MAIN_FRAME {
                format!("    at {}", self.current_origin)
            } else {
                let location = self
                    .sources
                    .find_by_name(name, Some(self.current_origin))
                    .and_then(|id| self.sources.function(id))
                    .map_or_else(|| self.current_origin.to_owned(), |span| span.location());
                format!("    at {label} ({location})")
            };
            lines.push(line);
        }
        lines.join("\n")
    }
}

fn call_frames(_this: &JsValue, _args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let names: Vec<JsValue> = context
        .stack_trace()
        .map(|frame| JsValue::from(frame.code_block().name().clone()))
        .collect();
    Ok(JsArray::from_iter(names, context).into())
}

fn drain_events(context: &mut Context) -> WatchResult<Vec<RawEvent>> {
    let value = context
        .eval(Source::from_bytes(b"globalThis.__pw_drain()"))
        .map_err(|error| WatchError::new("js.drain_failed", error.to_string()))?;
    let text = value
        .to_string(context)
        .map_err(|error| WatchError::new("js.drain_failed", error.to_string()))?
        .to_std_string_escaped();

    serde_json::from_str(&text).map_err(|error| {
        WatchError::new(
            "js.event_decode_failed",
            format!("invalid page event batch: {error}"),
        )
    })
}

fn dispatch_events<S: ObservationSink>(
    interceptor: &MessageInterceptor<S>,
    loaded: &LoadedScripts<'_>,
    events: Vec<RawEvent>,
    report: &mut JsExecutionReport,
) {
    for event in events {
        match event {
            RawEvent::Listener {
                via,
                handler,
                frames,
            } => {
                let stack = Some(loaded.stack_text(&frames)).filter(|text| !text.is_empty());
                let handler = handler.into_handler(loaded.sources);
                let registration = Registration::new(handler, stack, via.into());
                if interceptor.observe(&registration, &NoCallers).is_some() {
                    report.listeners_reported = report.listeners_reported.saturating_add(1);
                }
            }
            RawEvent::PushState { url } => {
                log::debug!("history push to `{url}`");
                interceptor.history_pushed();
                report.history_pushes = report.history_pushes.saturating_add(1);
            }
            RawEvent::ChangePage => {
                interceptor.page_changed();
                report.page_changes = report.page_changes.saturating_add(1);
            }
            RawEvent::Log { message } => interceptor.forward_page_log(message),
        }
    }
}

fn build_host_values(page: &PageContext) -> String {
    let origin = url::Url::parse(&page.page_url)
        .map(|parsed| parsed.origin().ascii_serialization())
        .unwrap_or_default();
    let name = page
        .frames
        .node(page.frames.current())
        .map(|node| node.name.clone())
        .unwrap_or_default();
    let host = serde_json::json!({
        "href": page.page_url,
        "origin": origin,
        "domain": page.domain(),
        "name": name,
    });
    format!("globalThis.__pw_host = {host};")
}

fn hard_script_byte_cap(preferred: usize) -> usize {
    let scaled = preferred.saturating_mul(4);
    let bounded = scaled.min(16 * 1024 * 1024);
    bounded.max(preferred)
}

#[cfg(test)]
mod tests {
    use super::InstrumentedRuntime;
    use super::JsRuntimeConfig;
    use super::ScriptSource;
    use crate::hops::FrameTree;
    use crate::intercept::PageContext;
    use pw_ipc::InboundMessage;
    use pw_ipc::ObservationSink;
    use std::cell::RefCell;

    const SENTRY_PAGE: &str = r#"function onPayment(e) { if (e.origin) eval(e.data); }
function wrap(fn) {
  var sentryWrapped = function () {
    var args = Array.prototype.slice.call(arguments);
    try {
      if (typeof fn === "function") { return fn.apply(this, args); }
    } catch (ex) { throw ex; }
  };
  sentryWrapped.__sentry_original__ = fn;
  return sentryWrapped;
}
var nativeAdd = window.addEventListener;
window.addEventListener = function (type, listener) { return nativeAdd.call(this, type, wrap(listener)); };
function boot() { addEventListener('message', onPayment); }
boot();
"#;

    #[derive(Default)]
    struct RecordingSink {
        messages: RefCell<Vec<InboundMessage>>,
    }

    impl RecordingSink {
        fn listeners(&self) -> Vec<InboundMessage> {
            self.messages
                .borrow()
                .iter()
                .filter(|message| message.listener.is_some())
                .cloned()
                .collect()
        }

        fn count(&self, predicate: fn(&InboundMessage) -> bool) -> usize {
            self.messages
                .borrow()
                .iter()
                .filter(|message| predicate(message))
                .count()
        }
    }

    impl ObservationSink for RecordingSink {
        fn emit(&self, message: InboundMessage) {
            self.messages.borrow_mut().push(message);
        }
    }

    fn page() -> PageContext {
        PageContext::new("https://app.example/inbox")
    }

    fn run(scripts: &[&str]) -> (super::JsExecutionReport, RecordingSink) {
        let sink = RecordingSink::default();
        let scripts: Vec<ScriptSource> = scripts
            .iter()
            .enumerate()
            .map(|(index, source)| ScriptSource::inline(index, *source))
            .collect();
        let report = InstrumentedRuntime::default().execute(&page(), &scripts, &sink);
        (report, sink)
    }

    #[test]
    fn reports_add_event_listener_registrations() {
        let (report, sink) = run(&[
            "window.addEventListener('message', function onMessage(e) { route(e.data); });",
            "addEventListener('click', function () {});",
        ]);

        assert_eq!(report.scripts_executed, 2);
        assert_eq!(report.listeners_reported, 1);
        let listeners = sink.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].hops.as_deref(), Some("top"));
        assert_eq!(listeners[0].window.as_deref(), Some("top"));
        assert_eq!(listeners[0].domain.as_deref(), Some("app.example"));
        assert_eq!(
            listeners[0].listener.as_deref(),
            Some("function onMessage(e) { route(e.data); }")
        );
        assert_eq!(listeners[0].stack.as_deref(), Some("at inline:0"));
    }

    #[test]
    fn records_handler_body_and_registering_function() {
        let sink = RecordingSink::default();
        let script = ScriptSource {
            origin: "https://app.example/static/app.js".to_owned(),
            source: "function setup() {\n  window.addEventListener('message', function onMessage(e) { if (e.origin) eval(e.data); });\n}\nsetup();".to_owned(),
        };
        let report = InstrumentedRuntime::default().execute(&page(), &[script], &sink);
        assert_eq!(report.scripts_failed, 0, "{:?}", report.errors);

        let listeners = sink.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(
            listeners[0].listener.as_deref(),
            Some("function onMessage(e) { if (e.origin) eval(e.data); }")
        );
        assert_eq!(
            listeners[0].stack.as_deref(),
            Some("at setup (https://app.example/static/app.js:1:1)")
        );
        let full = listeners[0].fullstack.clone().unwrap_or_default();
        assert_eq!(full.len(), 5);
        assert_eq!(full[0], "Error");
        assert_eq!(full[4], "at https://app.example/static/app.js");
    }

    #[test]
    fn assigned_and_arrow_handlers_keep_their_text() {
        let (report, sink) = run(&[
            "var relay = function (e) { parent.postMessage(e.data, '*'); };\naddEventListener('message', relay);",
            "onmessage = (e) => { document.title = e.data; };",
        ]);
        assert_eq!(report.scripts_failed, 0, "{:?}", report.errors);

        let listeners = sink.listeners();
        assert_eq!(listeners.len(), 2);
        assert_eq!(
            listeners[0].listener.as_deref(),
            Some("function (e) { parent.postMessage(e.data, '*'); }")
        );
        assert_eq!(
            listeners[1].listener.as_deref(),
            Some("(e) => { document.title = e.data; }")
        );
        assert_eq!(listeners[1].stack.as_deref(), Some("at inline:1"));
    }

    #[test]
    fn sentry_wrapped_page_handler_is_unwrapped() {
        let sink = RecordingSink::default();
        let script = ScriptSource {
            origin: "https://app.example/static/vendor.js".to_owned(),
            source: SENTRY_PAGE.to_owned(),
        };
        let report = InstrumentedRuntime::default().execute(&page(), &[script], &sink);
        assert_eq!(report.scripts_failed, 0, "{:?}", report.errors);

        let listeners = sink.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(
            listeners[0].listener.as_deref(),
            Some("function onPayment(e) { if (e.origin) eval(e.data); }")
        );
        assert!(
            listeners[0]
                .stack
                .as_deref()
                .is_some_and(|line| line.starts_with("at boot (https://app.example/static/vendor.js:"))
        );
        assert_eq!(
            sink.count(|message| message.log.as_deref() == Some("unwrapped sentry wrapper")),
            1
        );
    }

    #[test]
    fn reports_onmessage_assignments() {
        let (report, sink) = run(&["onmessage = function onMessage(e) {};", "window.onmessage = null;"]);
        assert_eq!(report.scripts_failed, 0);
        assert_eq!(sink.listeners().len(), 1);
    }

    #[test]
    fn internal_marker_suppresses_reporting() {
        let (report, sink) = run(&[
            "var own = function (e) {}; own.__pw_internal__ = true; addEventListener('message', own);",
        ]);
        assert_eq!(report.scripts_executed, 1);
        assert!(sink.listeners().is_empty());
    }

    #[test]
    fn history_and_navigation_signals_are_emitted() {
        let (report, sink) = run(&[
            "history.pushState({}, '', '/thread/1');",
            "location.assign('https://app.example/logout');",
        ]);
        assert_eq!(report.history_pushes, 1);
        assert_eq!(report.page_changes, 1);
        assert_eq!(sink.count(InboundMessage::is_push_state), 1);
        assert_eq!(sink.count(InboundMessage::is_change_page), 1);
    }

    #[test]
    fn registered_listeners_still_receive_messages() {
        let (report, sink) = run(&[
            "addEventListener('message', function relay(e) { history.pushState(null, '', '/' + e.data); });",
            "postMessage('ping', '*');",
        ]);
        assert_eq!(report.scripts_failed, 0);
        assert_eq!(report.listeners_reported, 1);
        assert_eq!(sink.count(InboundMessage::is_push_state), 1);
    }

    #[test]
    fn jquery_sweep_reports_stored_handlers() {
        let (report, sink) = run(&[
            "function jQuery() {}\njQuery._data = function (elem, name) { return name === 'events' ? { message: [{ handler: function cart(e) {} }] } : undefined; };",
        ]);
        assert_eq!(report.listeners_reported, 1);
        let listeners = sink.listeners();
        assert_eq!(listeners.len(), 1);
        assert_eq!(listeners[0].stack.as_deref(), Some("jQuery"));
    }

    #[test]
    fn failing_script_does_not_stop_later_scripts() {
        let (report, sink) = run(&[
            "throw new Error('boom');",
            "addEventListener('message', function later(e) {});",
        ]);
        assert_eq!(report.scripts_failed, 1);
        assert_eq!(report.scripts_executed, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(sink.listeners().len(), 1);
    }

    #[test]
    fn frame_name_and_hops_follow_page_context() {
        let mut frames = FrameTree::new("https://app.example");
        let root = frames.root();
        let child = frames
            .add_child(root, "composer", "https://widgets.example")
            .unwrap_or_else(|_| unreachable!());
        assert!(frames.set_current(child).is_ok());
        let page = PageContext::new("https://widgets.example/compose").with_frames(frames);

        let sink = RecordingSink::default();
        let report = InstrumentedRuntime::default().execute(
            &page,
            &[ScriptSource::inline(0, "addEventListener('message', function w(e) {});")],
            &sink,
        );
        assert_eq!(report.listeners_reported, 1);
        let listeners = sink.listeners();
        assert_eq!(listeners[0].window.as_deref(), Some("composer"));
        assert_eq!(listeners[0].hops.as_deref(), Some("top.frames[0]"));
        assert_eq!(listeners[0].domain.as_deref(), Some("widgets.example"));
    }

    #[test]
    fn oversized_scripts_are_skipped() {
        let runtime = InstrumentedRuntime::new(JsRuntimeConfig {
            max_script_bytes: 16,
            ..JsRuntimeConfig::default()
        });
        let sink = RecordingSink::default();
        let filler = " ".repeat(200);
        let report = runtime.execute(
            &page(),
            &[ScriptSource::inline(0, format!("{filler}addEventListener('message', function (e) {{}});"))],
            &sink,
        );
        assert_eq!(report.scripts_skipped, 1);
        assert!(sink.listeners().is_empty());
    }

    #[test]
    fn empty_script_list_is_a_no_op() {
        let (report, sink) = run(&[]);
        assert_eq!(report.scripts_seen, 0);
        assert!(sink.messages.borrow().is_empty());
    }
}
