//! The runtime instrumentor: per-frame callback, per-thread stacks, budgets
//! and event emission.
//!
//! An [`Instrumentor`] is installed into a dynamic-language runtime's trace
//! facility. The runtime invokes [`Instrumentor::on_frame`] for every
//! function entry; the returned [`Continuation`] instructs it whether to
//! keep delivering events for that frame and its descendants. Exit events
//! (`Return`/`Exception`) are delivered for every frame the engine answered
//! [`Continuation::Trace`] for, on the same thread, in LIFO order.
//!
//! The callback is designed to be safe under any host behavior: it never
//! panics into the host (failures are swallowed and counted), it takes no
//! lock on the per-thread fast path, and it holds no lock across I/O.

use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

pub mod classify;

mod config;
pub use config::{
    BackpressurePolicy, InstrumentorConfig, DEFAULT_MAX_CALLS, DEFAULT_MAX_DEPTH,
    DEFAULT_PORT_JVM, DEFAULT_PORT_PYTHON,
};

mod filter;
pub use filter::FilterPolicy;

mod session;
pub use session::{
    ActiveCall, FunctionStats, Session, SessionArtifact, SessionSummary,
};

mod stream;
pub use stream::StreamServer;

pub mod types;
use types::truncated;
pub use types::{
    CallEvent, CallRecord, Continuation, EventMeta, Frame, FrameArg, FrameKind,
    MethodRef, RegistryEvent, ReturnEvent, TraceEvent, ValuePreview, UNSERIALIZABLE,
};

/// Engine errors surfaced from the lifecycle operations.
///
/// Frame callbacks never raise; these only come out of `enable`, `disable`
/// and the finalizer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `enable()` was called while the engine is active.
    #[error("instrumentor is already enabled")]
    AlreadyEnabled,
    /// The engine reached `Finalized`; re-initialization is not permitted
    /// for the life of the process.
    #[error("instrumentor is finalized")]
    Finalized,
    /// Listener or artifact I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Artifact serialization failed.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle states of the engine.
///
/// Transitions are one-way: `Uninstalled → Enabled → Disabling → Finalized`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Constructed, callback not yet installed.
    Uninstalled = 0,
    /// Callback installed, events flowing.
    Enabled = 1,
    /// Shutting down: callbacks drain, server closing, finalizer pending.
    Disabling = 2,
    /// Finalizer ran; terminal.
    Finalized = 3,
}

impl EngineState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Enabled,
            2 => Self::Disabling,
            3 => Self::Finalized,
            _ => Self::Uninstalled,
        }
    }
}

const EXCEPTION_MESSAGE_MAX: usize = 300;
const VALUE_PREVIEW_MAX: usize = 200;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Engine-assigned thread identity, stable for the thread's lifetime.
    static THREAD_IDENT: (u64, String) = {
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        let name = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("thread-{id}"));
        (id, name)
    };

    /// Per-thread stacks, one entry per live engine that has seen this
    /// thread. Only the owning thread ever touches its entry.
    static FRAME_STATES: RefCell<Vec<EngineThreadState>> = const { RefCell::new(Vec::new()) };
}

struct EngineThreadState {
    engine_id: u64,
    state: ThreadState,
}

struct ThreadState {
    stack: Vec<StackSlot>,
    /// Number of excluded-subtree slots currently on the stack.
    excluded: usize,
    in_callback: bool,
    thread_id: u64,
    thread_name: String,
}

impl ThreadState {
    fn new(thread_id: u64, thread_name: String) -> Self {
        Self { stack: Vec::new(), excluded: 0, in_callback: false, thread_id, thread_name }
    }

    fn nearest_open_id(&self) -> Option<String> {
        self.stack.iter().rev().find_map(|slot| match slot {
            StackSlot::Open(record) => Some(record.call_id.clone()),
            _ => None,
        })
    }

    fn has_open(&self) -> bool {
        self.stack.iter().any(|slot| matches!(slot, StackSlot::Open(_)))
    }
}

/// One entry of a thread's call stack.
enum StackSlot {
    /// A recorded call; the record is owned here until the frame exits.
    Open(Box<CallRecord>),
    /// Depth placeholder for a frame suppressed by dedup or sampling.
    Suppressed,
    /// Depth placeholder for a frame beyond `max_depth`.
    Deep,
    /// Root or member of an excluded subtree.
    Excluded,
}

/// The process-singleton tracing engine.
///
/// Owns the session, the filter policy and the stream server. All mutation
/// of shared state happens through the frame callback; accessors are safe
/// from any thread.
#[derive(Debug)]
pub struct Instrumentor {
    engine_id: u64,
    config: InstrumentorConfig,
    state: AtomicU8,
    session: Arc<Session>,
    filter: FilterPolicy,
    epoch: Instant,
    call_seq: AtomicU64,
    internal_errors: AtomicU64,
    server: Mutex<Option<StreamServer>>,
    final_dropped_events: AtomicU64,
    final_disconnects: AtomicU64,
}

impl Instrumentor {
    /// Creates a new engine with the given configuration.
    ///
    /// The session and its timestamped id exist from this point; the
    /// callback gate and the stream server come up on [`Self::enable`].
    pub fn new(config: InstrumentorConfig) -> Self {
        let filter = FilterPolicy::new(
            config.includes.clone(),
            config.excludes.clone(),
            config.coverage_limit,
            config.sample_rate,
        );
        let session = Arc::new(Session::new(config.language.clone()));
        Self {
            engine_id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            state: AtomicU8::new(EngineState::Uninstalled as u8),
            session,
            filter,
            epoch: Instant::now(),
            call_seq: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            server: Mutex::new(None),
            final_dropped_events: AtomicU64::new(0),
            final_disconnects: AtomicU64::new(0),
        }
    }

    /// Creates an engine from the `FLOWTRACE_*` environment.
    pub fn from_env() -> Self {
        Self::new(InstrumentorConfig::from_env())
    }

    /// Returns the engine configuration.
    pub const fn config(&self) -> &InstrumentorConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the session this engine records into.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the timestamped session tag.
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Returns the number of calls recorded so far.
    pub fn total_calls(&self) -> u64 {
        self.session.total_calls()
    }

    /// Returns the number of calls currently on some thread's stack.
    pub fn active_calls(&self) -> usize {
        self.session.active_calls()
    }

    /// Returns the sorted registered-method snapshot.
    pub fn registered_methods(&self) -> Vec<MethodRef> {
        self.session.registry_snapshot()
    }

    /// Callback failures swallowed so far.
    pub fn internal_errors(&self) -> u64 {
        self.internal_errors.load(Ordering::Relaxed)
    }

    /// Events dropped for slow subscribers under the drop policy.
    pub fn dropped_events(&self) -> u64 {
        self.server
            .lock()
            .as_ref()
            .map(StreamServer::dropped_events)
            .unwrap_or_else(|| self.final_dropped_events.load(Ordering::Relaxed))
    }

    /// Subscribers disconnected for cause so far.
    pub fn subscriber_disconnects(&self) -> u64 {
        self.server
            .lock()
            .as_ref()
            .map(StreamServer::disconnects)
            .unwrap_or_else(|| self.final_disconnects.load(Ordering::Relaxed))
    }

    /// Returns the bound stream-server port while the server is up.
    pub fn stream_port(&self) -> Option<u16> {
        self.server.lock().as_ref().map(|server| server.local_addr().port())
    }

    /// Returns the number of live stream subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.server.lock().as_ref().map(StreamServer::subscriber_count).unwrap_or(0)
    }

    /// Installs the callback gate and starts the stream server.
    ///
    /// Fails with [`Error::AlreadyEnabled`] while active and
    /// [`Error::Finalized`] after shutdown. If the stream server cannot
    /// bind, the engine reverts to `Uninstalled` and the error is returned;
    /// nothing is raised into the host.
    pub fn enable(&self) -> Result<(), Error> {
        if !self.transition(EngineState::Uninstalled, EngineState::Enabled) {
            return match self.state() {
                EngineState::Enabled => Err(Error::AlreadyEnabled),
                _ => Err(Error::Finalized),
            };
        }

        if let Some(port) = self.config.stream_port {
            let registry_session = Arc::clone(&self.session);
            let finalize_session = Arc::clone(&self.session);
            let trace_dir = self.config.trace_dir.clone();
            let write_summary = self.config.write_summary;
            let started = StreamServer::start(
                port,
                self.config.backpressure,
                Arc::new(move || registry_event(&registry_session)),
                Arc::new(move || {
                    if let Err(err) = finalize_session.finalize(&trace_dir, write_summary) {
                        log::error!("subscriber-requested finalize failed: {err}");
                    }
                }),
            );
            match started {
                Ok(server) => *self.server.lock() = Some(server),
                Err(err) => {
                    self.state.store(EngineState::Uninstalled as u8, Ordering::SeqCst);
                    return Err(err.into());
                }
            }
        }

        log::debug!("instrumentor enabled, session {}", self.session_id());
        Ok(())
    }

    /// Uninstalls the callback gate, closes the stream server and runs the
    /// finalizer. Idempotent: later calls are no-ops.
    pub fn disable(&self) {
        if !self.transition(EngineState::Enabled, EngineState::Disabling) {
            return;
        }
        self.shutdown_pipeline();
    }

    /// The per-frame trace callback. Never panics into the host.
    ///
    /// For `Call` events the returned continuation instructs the runtime
    /// whether to keep delivering events for the frame and its descendants;
    /// for exit events the value carries no meaning.
    pub fn on_frame(&self, kind: FrameKind, frame: &Frame<'_>, arg: FrameArg<'_>) -> Continuation {
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(kind, frame, arg)));
        match outcome {
            Ok(continuation) => continuation,
            Err(_) => {
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
                Continuation::Skip
            }
        }
    }

    fn dispatch(&self, kind: FrameKind, frame: &Frame<'_>, arg: FrameArg<'_>) -> Continuation {
        if self.state() != EngineState::Enabled || self.session.is_finalized() {
            return Continuation::Skip;
        }
        let Some(_guard) = ReentryGuard::acquire(self) else {
            return Continuation::Skip;
        };
        match kind {
            FrameKind::Call => self.handle_call(frame, arg),
            FrameKind::Return | FrameKind::Exception => self.handle_exit(kind, frame, arg),
        }
    }

    /// Frame entry: admission checks, record construction, `call` emission.
    fn handle_call(&self, frame: &Frame<'_>, arg: FrameArg<'_>) -> Continuation {
        // lifetime budget, a hard stop
        if self.session.total_calls() >= self.config.max_calls {
            if self.transition(EngineState::Enabled, EngineState::Disabling) {
                log::warn!(
                    "recorded-call budget of {} reached, tracing disabled",
                    self.config.max_calls
                );
                self.shutdown_pipeline();
            }
            return Continuation::Skip;
        }

        let (depth, parent_id, in_excluded_subtree, has_open, thread_id, thread_name) = self
            .with_thread_state(|state| {
                (
                    state.stack.len(),
                    state.nearest_open_id(),
                    state.excluded > 0,
                    state.has_open(),
                    state.thread_id,
                    state.thread_name.clone(),
                )
            });

        // members of an excluded subtree stay excluded
        if in_excluded_subtree {
            self.with_thread_state(|state| {
                state.stack.push(StackSlot::Excluded);
                state.excluded += 1;
            });
            return Continuation::Trace;
        }

        if !self.filter.should_trace(frame.module, frame.file) {
            // keep bookkeeping beneath a tracked ancestor; otherwise release
            // the whole subtree
            if has_open {
                self.with_thread_state(|state| {
                    state.stack.push(StackSlot::Excluded);
                    state.excluded += 1;
                });
                return Continuation::Trace;
            }
            return Continuation::Skip;
        }

        if depth >= self.config.max_depth {
            self.with_thread_state(|state| state.stack.push(StackSlot::Deep));
            return Continuation::Trace;
        }

        // dedup and sampling suppress streaming but keep depth accurate
        if !self.filter.coverage_admits(frame.file, frame.line) || !self.filter.sample_admits() {
            self.session.register_method(MethodRef::new(frame.module, frame.function));
            self.with_thread_state(|state| state.stack.push(StackSlot::Suppressed));
            return Continuation::Trace;
        }

        let arguments = match arg {
            FrameArg::Value(value) if self.config.capture_values => {
                Some(self.capture_preview(value))
            }
            _ => None,
        };

        let call_id = format!("c{}", self.call_seq.fetch_add(1, Ordering::Relaxed) + 1);
        let start_ns = self.monotonic_ns();
        let record = CallRecord {
            call_id: call_id.clone(),
            parent_id,
            thread_id,
            thread_name,
            session_id: self.session_id().to_string(),
            module: frame.module.to_string(),
            function: frame.function.to_string(),
            file: frame.file.to_string(),
            line: frame.line,
            signature: frame.signature.map(str::to_string),
            start_ns,
            end_ns: None,
            duration_ms: None,
            depth,
            protocol: classify::protocol_of(frame.module, frame.function, arguments.as_deref()),
            invocation_type: classify::invocation_type_of(frame.module, frame.function),
            correlation_id: frame.correlation_id.map(str::to_string),
            exception_kind: None,
            exception_message: None,
            arguments,
            return_value: None,
        };

        self.session.register_method(record.method());
        self.session.note_call();
        self.session.activate(
            &call_id,
            ActiveCall {
                module: record.module.clone(),
                function: record.function.clone(),
                thread_id,
                depth,
                start_ns,
            },
        );

        let event = self.call_event(&record);
        self.with_thread_state(|state| state.stack.push(StackSlot::Open(Box::new(record))));
        self.emit(TraceEvent::Call(event));
        Continuation::Trace
    }

    /// Frame exit: stack pop, coherence check, record close, `return`
    /// emission.
    fn handle_exit(&self, kind: FrameKind, frame: &Frame<'_>, arg: FrameArg<'_>) -> Continuation {
        let slot = self.with_thread_state(|state| {
            let slot = state.stack.pop();
            if matches!(slot, Some(StackSlot::Excluded)) {
                state.excluded = state.excluded.saturating_sub(1);
            }
            slot
        });

        let mut record = match slot {
            // a frame we never saw enter (engine enabled mid-call)
            None => return Continuation::Skip,
            Some(StackSlot::Excluded | StackSlot::Suppressed | StackSlot::Deep) => {
                return Continuation::Skip;
            }
            Some(StackSlot::Open(record)) => record,
        };

        if record.module != frame.module || record.function != frame.function {
            log::warn!(
                "call stack out of step: expected exit of {}.{}, saw {}.{}; discarding both",
                record.module,
                record.function,
                frame.module,
                frame.function
            );
            self.session.deactivate(&record.call_id);
            return Continuation::Skip;
        }

        let end_ns = self.monotonic_ns();
        record.end_ns = Some(end_ns);
        record.duration_ms = Some(end_ns.saturating_sub(record.start_ns) as f64 / 1_000_000.0);

        if let FrameArg::Exception { kind, message } = arg {
            record.exception_kind = Some(kind.to_string());
            record.exception_message = Some(truncated(message, EXCEPTION_MESSAGE_MAX));
        } else if kind == FrameKind::Exception {
            // unwinding without detail from the runtime
            record.exception_kind = Some("Exception".to_string());
        } else if let FrameArg::Value(value) = arg {
            if self.config.capture_values {
                record.return_value = Some(self.capture_preview(value));
            }
        }

        self.session.deactivate(&record.call_id);
        let event = self.return_event(&record);
        self.session.push_completed(*record);
        self.emit(TraceEvent::Return(event));
        Continuation::Skip
    }

    fn call_event(&self, record: &CallRecord) -> CallEvent {
        CallEvent {
            meta: self.event_meta(),
            call_id: record.call_id.clone(),
            parent_id: record.parent_id.clone(),
            thread_id: record.thread_id,
            thread_name: record.thread_name.clone(),
            module: record.module.clone(),
            function: record.function.clone(),
            file: record.file.clone(),
            line: record.line,
            signature: record.signature.clone(),
            depth: record.depth,
            protocol: record.protocol,
            invocation_type: record.invocation_type,
            correlation_id: record.correlation_id.clone(),
            arguments: record.arguments.clone(),
        }
    }

    fn return_event(&self, record: &CallRecord) -> ReturnEvent {
        ReturnEvent {
            meta: self.event_meta(),
            call_id: record.call_id.clone(),
            parent_id: record.parent_id.clone(),
            thread_id: record.thread_id,
            duration_ms: record.duration_ms.unwrap_or(0.0),
            depth: record.depth,
            exception_kind: record.exception_kind.clone(),
            exception_message: record.exception_message.clone(),
            return_value: record.return_value.clone(),
        }
    }

    fn event_meta(&self) -> EventMeta {
        EventMeta {
            timestamp: wall_seconds(),
            session_id: self.session_id().to_string(),
            process_id: self.session.process_id(),
            language: self.session.language().to_string(),
        }
    }

    fn emit(&self, event: TraceEvent) {
        let server = self.server.lock();
        if let Some(server) = server.as_ref() {
            let line: Arc<str> = event.to_line().into();
            server.broadcast(&line);
        }
    }

    fn capture_preview(&self, value: &dyn ValuePreview) -> String {
        match std::panic::catch_unwind(AssertUnwindSafe(|| value.preview())) {
            Ok(preview) => truncated(&preview, VALUE_PREVIEW_MAX),
            Err(_) => {
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
                UNSERIALIZABLE.to_string()
            }
        }
    }

    fn monotonic_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn transition(&self, from: EngineState, to: EngineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Shared tail of `disable()` and budget exhaustion: server down first
    /// so subscribers see EOF, then the artifact, then the terminal state.
    fn shutdown_pipeline(&self) {
        if let Some(mut server) = self.server.lock().take() {
            self.final_dropped_events.store(server.dropped_events(), Ordering::Relaxed);
            self.final_disconnects.store(server.disconnects(), Ordering::Relaxed);
            server.close();
        }
        match self.session.finalize(&self.config.trace_dir, self.config.write_summary) {
            Ok(path) => log::debug!("session artifact written to {}", path.display()),
            Err(err) => log::error!("failed to write session artifact: {err}"),
        }
        self.state.store(EngineState::Finalized as u8, Ordering::SeqCst);
        log::debug!("instrumentor finalized, session {}", self.session_id());
    }

    fn with_thread_state<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        FRAME_STATES.with(|cell| {
            let mut states = cell.borrow_mut();
            if let Some(position) =
                states.iter().position(|entry| entry.engine_id == self.engine_id)
            {
                return f(&mut states[position].state);
            }
            let (thread_id, thread_name) = THREAD_IDENT.with(Clone::clone);
            states.push(EngineThreadState {
                engine_id: self.engine_id,
                state: ThreadState::new(thread_id, thread_name),
            });
            let entry = states.last_mut().expect("state was just pushed");
            f(&mut entry.state)
        })
    }
}

impl Drop for Instrumentor {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Blocks callback re-entry on the same thread (e.g. a value preview that
/// itself runs traced code).
struct ReentryGuard<'a> {
    engine: &'a Instrumentor,
}

impl<'a> ReentryGuard<'a> {
    fn acquire(engine: &'a Instrumentor) -> Option<Self> {
        let entered = engine.with_thread_state(|state| {
            if state.in_callback {
                false
            } else {
                state.in_callback = true;
                true
            }
        });
        entered.then_some(Self { engine })
    }
}

impl Drop for ReentryGuard<'_> {
    fn drop(&mut self) {
        self.engine.with_thread_state(|state| state.in_callback = false);
    }
}

/// Builds the registry-snapshot event for the current session state.
fn registry_event(session: &Session) -> TraceEvent {
    TraceEvent::FunctionRegistry(RegistryEvent {
        meta: EventMeta {
            timestamp: wall_seconds(),
            session_id: session.session_id().to_string(),
            process_id: session.process_id(),
            language: session.language().to_string(),
        },
        methods: session.registry_snapshot(),
        total_calls: session.total_calls(),
    })
}

fn wall_seconds() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}
