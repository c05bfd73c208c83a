//! Interception and unwrapping engine for cross-document message handlers.
//!
//! Registrations flow through [`intercept::MessageInterceptor`], which peels
//! known instrumentation wrappers ([`unwrap`]), picks the registering call
//! site out of the captured stack ([`callsite`]), resolves the frame path
//! ([`hops`]) and emits one observation per registration. [`runtime`] hosts
//! page scripts in boa with the registration points hooked, recovering
//! handler source through [`source_map`].

pub mod callsite;
pub mod handler;
pub mod hops;
pub mod intercept;
pub mod runtime;
pub mod signature;
pub mod source_map;
pub mod unwrap;

pub use callsite::CallSite;
pub use callsite::CallSiteLocator;
pub use callsite::StackSource;
pub use handler::HandlerValue;
pub use handler::PropertyValue;
pub use hops::FrameId;
pub use hops::FrameTree;
pub use intercept::InterceptPolicy;
pub use intercept::ListenerHook;
pub use intercept::MessageInterceptor;
pub use intercept::PageContext;
pub use intercept::Registration;
pub use intercept::RegistrationBroker;
pub use intercept::RegistrationPath;
pub use runtime::InstrumentedRuntime;
pub use runtime::JsExecutionReport;
pub use runtime::JsRuntimeConfig;
pub use runtime::ScriptError;
pub use runtime::ScriptSource;
pub use signature::SignatureMatcher;
pub use signature::WrapperShape;
pub use signature::WrapperSignature;
pub use source_map::FunctionSpan;
pub use source_map::SourceIndex;
pub use unwrap::CallerLookup;
pub use unwrap::NoCallers;
pub use unwrap::UnwrapRule;
pub use unwrap::Unwrapped;
pub use unwrap::Unwrapper;
