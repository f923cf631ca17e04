//! Process-boundary activation.
//!
//! The embedding runtime loads this at interpreter startup (for CPython via
//! a `.pth`-installed side-effect module, for other runtimes via their agent
//! entry point) and calls [`init_from_env`]. Activation is gated on
//! `FLOWTRACE_ENABLED=1`; everything else about the engine is configured
//! through the other `FLOWTRACE_*` variables. A configuration problem never
//! prevents host-program execution.

use crate::tracing::Instrumentor;
use std::sync::OnceLock;

/// The process-wide engine slot. The engine lifecycle is one-way, so the
/// slot is write-once: re-initialization inside the same process is not
/// possible.
static GLOBAL: OnceLock<Instrumentor> = OnceLock::new();

/// Value `FLOWTRACE_ENABLED` must hold for activation; anything else is
/// inert.
const ENABLED_VALUE: &str = "1";

/// Constructs and enables the process-wide engine if `FLOWTRACE_ENABLED=1`.
///
/// Returns the engine when tracing is active after the call. Idempotent: a
/// second invocation returns the already-installed engine. Never panics and
/// never raises into the host; failures are logged and leave the host
/// untraced.
pub fn init_from_env() -> Option<&'static Instrumentor> {
    if std::env::var("FLOWTRACE_ENABLED").as_deref() != Ok(ENABLED_VALUE) {
        return None;
    }

    let engine = GLOBAL.get_or_init(Instrumentor::from_env);
    match engine.enable() {
        Ok(()) => Some(engine),
        Err(crate::tracing::Error::AlreadyEnabled) => Some(engine),
        Err(err) => {
            log::warn!("tracing not activated: {err}");
            None
        }
    }
}

/// Returns the process-wide engine, if one was installed.
pub fn global() -> Option<&'static Instrumentor> {
    GLOBAL.get()
}

/// Disables the process-wide engine and writes the session artifact.
///
/// A no-op when no engine was installed or it is already finalized.
pub fn shutdown() {
    if let Some(engine) = GLOBAL.get() {
        engine.disable();
    }
}

/// RAII handle that runs [`shutdown`] on drop.
///
/// The embedding runtime holds one for the life of the interpreter so the
/// finalizer runs on orderly interpreter teardown.
#[derive(Debug, Default)]
#[must_use = "the guard finalizes the session when dropped"]
pub struct ShutdownGuard(());

impl ShutdownGuard {
    /// Creates the guard.
    pub const fn new() -> Self {
        Self(())
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        shutdown();
    }
}
