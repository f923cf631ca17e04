//! Types for representing recorded calls and wire events.

use serde::{Deserialize, Serialize};

/// A reference to an instrumented function: the (module, function) pair.
///
/// Ordered so registry snapshots serialize deterministically.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    /// Dotted module path of the function.
    pub module: String,
    /// Unqualified function name.
    pub function: String,
}

impl MethodRef {
    /// Creates a new method reference.
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self { module: module.into(), function: function.into() }
    }
}

impl core::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

/// Advisory wire-protocol label for a call.
///
/// Derived from lexical clues only, see
/// [`protocol_of`](crate::tracing::classify::protocol_of).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Database access through a driver or ORM.
    Sql,
    /// HTTP client or server handling.
    Http,
    /// gRPC stubs and protobuf plumbing.
    Grpc,
    /// Kafka producers and consumers.
    Kafka,
    /// RabbitMQ / AMQP messaging.
    Amqp,
    /// Redis client calls.
    Redis,
    /// WebSocket / STOMP messaging.
    WebSocket,
    /// Futures, reactive streams and other asynchronous plumbing.
    Async,
}

impl Protocol {
    /// Returns the wire representation of the label.
    pub const fn to_str(self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::Http => "HTTP",
            Self::Grpc => "GRPC",
            Self::Kafka => "KAFKA",
            Self::Amqp => "AMQP",
            Self::Redis => "REDIS",
            Self::WebSocket => "WEBSOCKET",
            Self::Async => "ASYNC",
        }
    }
}

impl core::fmt::Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.to_str())
    }
}

/// How a call entered the traced program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationType {
    /// Externally reachable entry point (controller, resource, endpoint).
    ApiEntry,
    /// Event or message handler.
    EventHandler,
    /// Scheduled / timer driven invocation.
    Scheduled,
    /// Completion or functional callback.
    Callback,
    /// Everything else.
    #[default]
    Internal,
}

impl InvocationType {
    /// Returns the wire representation of the label.
    pub const fn to_str(self) -> &'static str {
        match self {
            Self::ApiEntry => "API_ENTRY",
            Self::EventHandler => "EVENT_HANDLER",
            Self::Scheduled => "SCHEDULED",
            Self::Callback => "CALLBACK",
            Self::Internal => "INTERNAL",
        }
    }
}

impl core::fmt::Display for InvocationType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.to_str())
    }
}

/// One recorded function invocation.
///
/// Open while the frame is on its thread's stack, closed on exit. Closed
/// records are never mutated again.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Process-unique monotonic identifier.
    pub call_id: String,
    /// Identifier of the nearest recorded ancestor on the same thread.
    ///
    /// `None` when no recorded ancestor exists, always the case at depth 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Engine-assigned identifier of the thread the call ran on.
    pub thread_id: u64,
    /// Name of the thread the call ran on.
    pub thread_name: String,
    /// Session the call belongs to.
    pub session_id: String,
    /// Dotted module path.
    pub module: String,
    /// Function name.
    pub function: String,
    /// Source file the function is defined in.
    pub file: String,
    /// Line of the function definition.
    pub line: u32,
    /// Declared signature, when the runtime exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Monotonic nanoseconds at entry.
    pub start_ns: u64,
    /// Monotonic nanoseconds at exit, set on close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ns: Option<u64>,
    /// Wall duration in milliseconds, derived on close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// 0-based call depth in this thread at entry.
    pub depth: usize,
    /// Advisory protocol label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Advisory invocation-type label.
    #[serde(default)]
    pub invocation_type: InvocationType,
    /// Logical-task identity supplied by the host, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Exception type name if the frame exited by raising.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_kind: Option<String>,
    /// Truncated exception message if the frame exited by raising.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    /// Captured argument preview, only with value capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Captured return-value preview, only with value capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
}

impl CallRecord {
    /// Returns true once the record has been closed.
    #[inline]
    pub const fn is_closed(&self) -> bool {
        self.end_ns.is_some()
    }

    /// Returns true if the frame exited by raising.
    #[inline]
    pub const fn is_error(&self) -> bool {
        self.exception_kind.is_some()
    }

    /// Returns the (module, function) pair of this record.
    pub fn method(&self) -> MethodRef {
        MethodRef::new(self.module.clone(), self.function.clone())
    }
}

/// Fields common to every wire event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    /// Session the event belongs to.
    pub session_id: String,
    /// Operating-system id of the traced process.
    pub process_id: u32,
    /// Language tag of the producing runtime.
    pub language: String,
}

/// Wire payload of a `call` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    /// Common event fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Identifier of the opened call.
    pub call_id: String,
    /// Identifier of the nearest tracked ancestor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Thread the call runs on.
    pub thread_id: u64,
    /// Name of that thread.
    pub thread_name: String,
    /// Dotted module path.
    pub module: String,
    /// Function name.
    pub function: String,
    /// Source file.
    pub file: String,
    /// Definition line.
    pub line: u32,
    /// Declared signature, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Call depth at entry.
    pub depth: usize,
    /// Advisory protocol label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Advisory invocation-type label.
    #[serde(default)]
    pub invocation_type: InvocationType,
    /// Logical-task identity supplied by the host, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Captured argument preview, only with value capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Wire payload of a `return` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnEvent {
    /// Common event fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Identifier of the closed call.
    pub call_id: String,
    /// Identifier of the nearest tracked ancestor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Thread the call ran on.
    pub thread_id: u64,
    /// Wall duration in milliseconds.
    pub duration_ms: f64,
    /// Call depth at entry.
    pub depth: usize,
    /// Exception type name if the frame exited by raising.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_kind: Option<String>,
    /// Truncated exception message if the frame exited by raising.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    /// Captured return-value preview, only with value capture enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<String>,
}

/// Wire payload of an `exception` event.
///
/// This engine reports exception exits on the `return` event; the variant is
/// part of the shared wire vocabulary because sibling producers emit it and
/// every consumer parses by tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEvent {
    /// Common event fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Identifier of the raising call, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Thread the exception was observed on, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<u64>,
    /// Exception type name.
    pub exception_kind: String,
    /// Truncated exception message.
    pub exception_message: String,
}

/// Wire payload of a `function_registry` event: a snapshot of every
/// (module, function) pair instrumented so far in the session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEvent {
    /// Common event fields.
    #[serde(flatten)]
    pub meta: EventMeta,
    /// Sorted registered-method snapshot.
    pub methods: Vec<MethodRef>,
    /// Calls recorded so far.
    pub total_calls: u64,
}

/// A wire event, one JSON object per `\n`-terminated line.
///
/// Consumers dispatch on the `type` tag and must tolerate unknown fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A frame was entered.
    Call(CallEvent),
    /// A frame exited, normally or by raising.
    Return(ReturnEvent),
    /// An exception was observed (sibling-producer vocabulary).
    Exception(ExceptionEvent),
    /// Registered-method snapshot.
    FunctionRegistry(RegistryEvent),
}

impl TraceEvent {
    /// Returns the common fields of the event.
    pub const fn meta(&self) -> &EventMeta {
        match self {
            Self::Call(e) => &e.meta,
            Self::Return(e) => &e.meta,
            Self::Exception(e) => &e.meta,
            Self::FunctionRegistry(e) => &e.meta,
        }
    }

    /// Serializes the event as one wire line, without the trailing newline.
    pub fn to_line(&self) -> String {
        // Infallible for these types: no non-string map keys, no fallible
        // serializers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The kind of frame event a runtime delivers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// A function frame was entered.
    Call,
    /// A function frame returned.
    Return,
    /// A function frame is unwinding with an exception.
    Exception,
}

impl FrameKind {
    /// Returns true for the two exit kinds.
    #[inline]
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::Return | Self::Exception)
    }
}

/// Borrowed view of one interpreter frame, valid for the duration of a
/// single callback invocation.
#[derive(Clone, Copy, Debug)]
pub struct Frame<'a> {
    /// Dotted module path.
    pub module: &'a str,
    /// Function name.
    pub function: &'a str,
    /// Source file of the function definition.
    pub file: &'a str,
    /// Line of the function definition.
    pub line: u32,
    /// Declared signature, when the runtime exposes one.
    pub signature: Option<&'a str>,
    /// Logical-task identity supplied by the host, if any.
    pub correlation_id: Option<&'a str>,
}

impl<'a> Frame<'a> {
    /// Creates a frame view for the given location.
    pub const fn new(module: &'a str, function: &'a str, file: &'a str, line: u32) -> Self {
        Self { module, function, file, line, signature: None, correlation_id: None }
    }

    /// Sets the declared signature.
    pub const fn with_signature(mut self, signature: &'a str) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Sets the logical-task identity.
    pub const fn with_correlation_id(mut self, correlation_id: &'a str) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Renders a short human-readable preview of a runtime value.
///
/// Implementations may panic; the engine absorbs panics and substitutes
/// [`UNSERIALIZABLE`].
pub trait ValuePreview {
    /// Returns the preview string.
    fn preview(&self) -> String;
}

impl<T: core::fmt::Display + ?Sized> ValuePreview for T {
    fn preview(&self) -> String {
        self.to_string()
    }
}

/// Sentinel substituted when a value preview panics.
pub const UNSERIALIZABLE: &str = "<unserializable>";

/// Per-kind payload accompanying a frame event.
#[derive(Clone, Copy)]
pub enum FrameArg<'a> {
    /// No payload.
    None,
    /// Arguments (on `Call`) or return value (on `Return`).
    Value(&'a dyn ValuePreview),
    /// The exception the frame is unwinding with (on `Exception`).
    Exception {
        /// Exception type name.
        kind: &'a str,
        /// Raw exception message; the engine truncates it.
        message: &'a str,
    },
}

impl core::fmt::Debug for FrameArg<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Exception { kind, .. } => write!(f, "Exception({kind})"),
        }
    }
}

/// Instruction returned to the runtime from the frame callback.
///
/// Meaningful for `Call` events only: `Trace` asks the runtime to deliver
/// this frame's exit event and to keep tracing its descendants, `Skip`
/// releases the frame and everything beneath it. Runtimes ignore the value
/// for exit events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum Continuation {
    /// Keep delivering events for this frame.
    Trace,
    /// Stop tracing this frame and its descendants.
    Skip,
}

impl Continuation {
    /// Returns true if the runtime should keep tracing the frame.
    #[inline]
    pub const fn is_trace(self) -> bool {
        matches!(self, Self::Trace)
    }
}

pub(crate) fn truncated(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
